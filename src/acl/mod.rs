//! Access-control list for target hosts
//!
//! Rules are matched against the literal hostname (or IP literal) of the
//! request target. Hostnames are never resolved to IPs before matching;
//! IP rules only apply when the target itself is an IP literal. This
//! keeps the gate free of DNS lookups and the TOCTOU window they open.

use crate::{Error, Result};
use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::debug;

/// Rule classes, in match order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleClass {
    /// Case-insensitive hostname equality
    Exact,
    /// `*.X` suffix match (does not match `X` itself)
    WildcardSuffix,
    /// Single IPv4 address
    SingleIp,
    /// IPv4 network in CIDR notation
    Cidr,
}

impl fmt::Display for RuleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleClass::Exact => write!(f, "exact hostname"),
            RuleClass::WildcardSuffix => write!(f, "wildcard suffix"),
            RuleClass::SingleIp => write!(f, "ip address"),
            RuleClass::Cidr => write!(f, "cidr range"),
        }
    }
}

/// Outcome of an ACL check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(RuleClass),
}

/// Blacklist evaluated against target hosts. Loaded once at startup and
/// immutable afterwards; an empty list allows everything.
#[derive(Debug, Default)]
pub struct Acl {
    exact: HashSet<String>,
    suffixes: Vec<String>,
    ips: HashSet<Ipv4Addr>,
    cidrs: Vec<Ipv4Net>,
    rule_count: usize,
}

impl Acl {
    pub fn new() -> Self {
        Acl::default()
    }

    /// Load rules from a blacklist file. A missing or malformed file is a
    /// configuration error.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read blacklist {}: {}", path.display(), e))
        })?;
        let acl = Self::parse(&content)?;
        debug!("loaded {} blacklist rules from {}", acl.rule_count, path.display());
        Ok(acl)
    }

    /// Parse blacklist text: one rule per line, `#` starts a comment,
    /// blank lines ignored.
    pub fn parse(content: &str) -> Result<Self> {
        let mut acl = Acl::new();
        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            acl.add_rule(line).map_err(|e| {
                Error::config(format!("blacklist line {}: {}", lineno + 1, e))
            })?;
        }
        Ok(acl)
    }

    /// Add one rule. The form decides the class: CIDR, then IP literal,
    /// then `*.` wildcard, then exact hostname.
    pub fn add_rule(&mut self, rule: &str) -> Result<()> {
        let rule = rule.to_lowercase();

        if rule.contains('/') {
            let net: Ipv4Net = rule
                .parse()
                .map_err(|e| Error::config(format!("invalid CIDR {:?}: {}", rule, e)))?;
            self.cidrs.push(net.trunc());
        } else if let Ok(ip) = rule.parse::<Ipv4Addr>() {
            self.ips.insert(ip);
        } else if let Some(suffix) = rule.strip_prefix("*.") {
            if suffix.is_empty() {
                return Err(Error::config("empty wildcard suffix"));
            }
            self.suffixes.push(suffix.to_string());
        } else {
            self.exact.insert(rule);
        }

        self.rule_count += 1;
        Ok(())
    }

    /// Check a target host (hostname or IP literal, optionally with a
    /// port). First match wins: exact, then wildcard, then IP/CIDR; no
    /// match means allow.
    pub fn check(&self, host_or_ip: &str) -> Decision {
        let hostname = strip_port(host_or_ip).to_lowercase();

        if self.exact.contains(&hostname) {
            return Decision::Deny(RuleClass::Exact);
        }

        for suffix in &self.suffixes {
            if hostname.len() > suffix.len()
                && hostname.ends_with(suffix)
                && hostname.as_bytes()[hostname.len() - suffix.len() - 1] == b'.'
            {
                return Decision::Deny(RuleClass::WildcardSuffix);
            }
        }

        if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
            if self.ips.contains(&ip) {
                return Decision::Deny(RuleClass::SingleIp);
            }
            for net in &self.cidrs {
                if net.contains(&ip) {
                    return Decision::Deny(RuleClass::Cidr);
                }
            }
        }

        Decision::Allow
    }

    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    pub fn is_empty(&self) -> bool {
        self.rule_count == 0
    }
}

/// Strip a trailing `:port`, handling bracketed and bare IPv6 literals.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rfind(':') {
        // More than one colon without brackets: bare IPv6 literal.
        Some(idx) if !host[..idx].contains(':') => &host[..idx],
        _ => host,
    }
}
