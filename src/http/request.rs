//! Parsed request head and target decomposition

use crate::{Error, Result};
use std::fmt;

/// HTTP protocol version accepted by the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Http10 => write!(f, "HTTP/1.0"),
            Version::Http11 => write!(f, "HTTP/1.1"),
        }
    }
}

/// URI scheme of a forwarded request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header sequence with case-insensitive lookup.
///
/// Original order and value case are preserved; duplicates are kept.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Derived decomposition of a request target, reconciled with the `Host`
/// header.
///
/// For CONNECT the target is `host:port`; proxy requests carry an
/// absolute-URI; origin-form requests populate only `path` and take their
/// authority from `Host`. `host` is empty when neither source supplies one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetParts {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl TargetParts {
    pub(crate) fn derive(method: &str, target: &str, headers: &Headers) -> Option<TargetParts> {
        if method == "CONNECT" {
            let (host, port) = split_authority(target, 443)?;
            return Some(TargetParts {
                scheme: Scheme::Https,
                host,
                port,
                path: String::new(),
            });
        }

        for scheme in [Scheme::Http, Scheme::Https] {
            let prefix = match scheme {
                Scheme::Http => "http://",
                Scheme::Https => "https://",
            };
            if let Some(rest) = target.strip_prefix(prefix) {
                let (authority, path) = match rest.find('/') {
                    Some(idx) => (&rest[..idx], &rest[idx..]),
                    None => (rest, "/"),
                };
                let (host, port) = split_authority(authority, scheme.default_port())?;
                return Some(TargetParts {
                    scheme,
                    host,
                    port,
                    path: path.to_string(),
                });
            }
        }

        // Origin-form: authority comes from the Host header.
        let (host, port) = match headers.get("host") {
            Some(h) => split_authority(h, 80)?,
            None => (String::new(), 80),
        };
        Some(TargetParts {
            scheme: Scheme::Http,
            host,
            port,
            path: target.to_string(),
        })
    }
}

/// Split `host[:port]` into a lowercased host and a port, handling
/// bracketed IPv6 literals. `None` on an unparsable port.
fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if authority.is_empty() {
        return None;
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = rest[..end].to_lowercase();
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Some((host, default_port));
        }
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((host, port));
    }

    match authority.rfind(':') {
        // More than one colon without brackets: a bare IPv6 literal.
        Some(idx) if authority[..idx].contains(':') => {
            Some((authority.to_lowercase(), default_port))
        }
        Some(idx) => {
            let port = authority[idx + 1..].parse().ok()?;
            Some((authority[..idx].to_lowercase(), port))
        }
        None => Some((authority.to_lowercase(), default_port)),
    }
}

/// A parsed HTTP/1.1 request head.
#[derive(Debug, Clone)]
pub struct Request {
    /// Uppercase method token
    pub method: String,
    /// Raw request-target bytes as received
    pub target: String,
    pub version: Version,
    pub headers: Headers,
    /// Declared request body length; zero when absent
    pub body_len: u64,
    /// Request body uses chunked transfer coding (passed through opaquely)
    pub chunked: bool,
    /// Derived target decomposition
    pub parts: TargetParts,
}

impl Request {
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    /// Destination host and port, required before gating or dialing.
    pub fn authority(&self) -> Result<(&str, u16)> {
        if self.parts.host.is_empty() {
            return Err(Error::address(format!(
                "no authority in target {:?} and no Host header",
                self.target
            )));
        }
        Ok((&self.parts.host, self.parts.port))
    }

    /// The request line as received, for log events.
    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method, self.target, self.version)
    }

    /// Canonical absolute URI used as the cache key.
    pub fn cache_key(&self) -> String {
        let path = if self.parts.path.is_empty() {
            "/"
        } else {
            &self.parts.path
        };
        format!(
            "{}://{}:{}{}",
            self.parts.scheme, self.parts.host, self.parts.port, path
        )
    }

    /// Serialize the head for an origin server: origin-form target,
    /// `Proxy-*` hop headers removed, `Connection: close` (the forward
    /// path does not pool upstream connections).
    pub fn serialize_forward(&self) -> Vec<u8> {
        let path = if self.parts.path.is_empty() {
            "/"
        } else {
            self.parts.path.as_str()
        };

        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(format!("{} {} {}\r\n", self.method, path, self.version).as_bytes());
        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("proxy-connection")
                || name.eq_ignore_ascii_case("proxy-authorization")
                || name.eq_ignore_ascii_case("connection")
            {
                continue;
            }
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out
    }
}
