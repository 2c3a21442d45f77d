//! Network utilities

use crate::{Error, Result};
use socket2::SockRef;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Timeout for outbound dials (forward and tunnel alike).
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Format `host:port` for dialing, bracketing IPv6 literals.
pub fn dial_address(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Dial an origin server with the standard connect timeout.
pub async fn dial(host: &str, port: u16) -> Result<TcpStream> {
    let addr = dial_address(host, port);
    debug!("dialing {}", addr);

    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::timeout(format!("connect to {} timed out", addr)))?
        .map_err(|e| Error::connection(format!("connect to {} failed: {}", addr, e)))?;

    configure_tcp_stream(&stream);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_address() {
        assert_eq!(dial_address("example.com", 80), "example.com:80");
        assert_eq!(dial_address("::1", 443), "[::1]:443");
    }
}
