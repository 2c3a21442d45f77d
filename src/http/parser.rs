//! Incremental HTTP/1.1 request-head parsing

use super::request::{Headers, Request, TargetParts, Version};
use bytes::{Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum accepted request-head size.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Request-head parse failure
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("request head exceeds {} bytes", MAX_HEAD_BYTES)]
    HeadTooLarge,

    #[error("malformed request line")]
    MalformedRequestLine,

    #[error("malformed header line")]
    MalformedHeader,

    #[error("obsolete header folding")]
    ObsoleteFold,

    #[error("unsupported protocol version: {0}")]
    VersionUnsupported(String),

    #[error("invalid request target")]
    InvalidTarget,

    #[error("invalid Content-Length")]
    InvalidContentLength,

    #[error("conflicting Content-Length and Transfer-Encoding")]
    ConflictingFraming,

    #[error("connection closed before request head completed")]
    UnexpectedEof,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<ParseError> for crate::Error {
    fn from(e: ParseError) -> Self {
        crate::Error::Parse(e.to_string())
    }
}

/// Stateful request-head reader.
///
/// Accepts arbitrary byte chunking; bytes read past the head terminator
/// stay buffered and are handed back through [`take_remaining`].
///
/// [`take_remaining`]: RequestParser::take_remaining
pub struct RequestParser {
    buf: BytesMut,
}

impl RequestParser {
    pub fn new() -> Self {
        RequestParser {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Bytes currently buffered: head fragments before a successful parse,
    /// body bytes after one.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Take the bytes read past the end of the head (the start of the
    /// request body).
    pub fn take_remaining(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Consume the stream until CRLF-CRLF and parse the request head.
    pub async fn parse_head<R>(&mut self, stream: &mut R) -> Result<Request, ParseError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(end) = find_head_end(&self.buf) {
                let head = self.buf.split_to(end + 4);
                return parse_head_bytes(&head[..end]);
            }

            if self.buf.len() >= MAX_HEAD_BYTES {
                return Err(ParseError::HeadTooLarge);
            }

            let n = stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(ParseError::UnexpectedEof);
            }
        }
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head_bytes(head: &[u8]) -> Result<Request, ParseError> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(ParseError::MalformedRequestLine)?;

    // Exactly three tokens separated by single spaces.
    let mut tokens = request_line.split(' ');
    let (method, target, version) = match (tokens.next(), tokens.next(), tokens.next(), tokens.next())
    {
        (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() && !v.is_empty() => {
            (m, t, v)
        }
        _ => return Err(ParseError::MalformedRequestLine),
    };

    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        other => return Err(ParseError::VersionUnsupported(other.to_string())),
    };

    let method = method.to_ascii_uppercase();

    let mut headers = Headers::new();
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(ParseError::ObsoleteFold);
        }
        let (name, value) = line.split_once(':').ok_or(ParseError::MalformedHeader)?;
        if name.is_empty() {
            return Err(ParseError::MalformedHeader);
        }
        headers.push(name, value.trim_start());
    }

    let transfer_encoding = headers.get("transfer-encoding");
    let chunked = transfer_encoding
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    let body_len = match headers.get("content-length") {
        Some(v) => {
            if transfer_encoding.is_some() {
                return Err(ParseError::ConflictingFraming);
            }
            v.trim()
                .parse::<u64>()
                .map_err(|_| ParseError::InvalidContentLength)?
        }
        None => 0,
    };

    let parts =
        TargetParts::derive(&method, target, &headers).ok_or(ParseError::InvalidTarget)?;

    Ok(Request {
        method,
        target: target.to_string(),
        version,
        headers,
        body_len,
        chunked,
        parts,
    })
}
