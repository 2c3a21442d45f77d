//! Access-event log
//!
//! One line per connection outcome, written to `access.log` in the log
//! directory. Rotation is left to external tooling.

use crate::{Error, Result};
use chrono::Local;
use parking_lot::Mutex;
use std::fmt;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use tracing::debug;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};

/// Final disposition of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allowed,
    Blocked,
    Auth,
    Error,
}

impl Outcome {
    fn level(self) -> &'static str {
        match self {
            Outcome::Error => "ERROR",
            _ => "INFO",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Allowed => write!(f, "ALLOWED"),
            Outcome::Blocked => write!(f, "BLOCKED"),
            Outcome::Auth => write!(f, "AUTH"),
            Outcome::Error => write!(f, "ERROR"),
        }
    }
}

/// A finished-connection event.
pub struct AccessEvent<'a> {
    /// Pipeline that handled the connection (FORWARD, TUNNEL, CACHE, REQUEST)
    pub event: &'a str,
    pub client: SocketAddr,
    /// `host:port` of the target, or `-` when none was resolved
    pub target: &'a str,
    /// `method target version`, or `-` before a head was parsed
    pub request_line: &'a str,
    pub outcome: Outcome,
    pub sent: u64,
    pub received: u64,
    pub reason: Option<&'a str>,
}

impl fmt::Display for AccessEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {} | {} -> {} | {} | {} | sent={} recv={}",
            self.outcome.level(),
            self.event,
            self.client,
            self.target,
            self.request_line,
            self.outcome,
            self.sent,
            self.received,
        )?;
        if let Some(reason) = self.reason {
            write!(f, " | reason={}", reason)?;
        }
        Ok(())
    }
}

/// Writer for the access log. Cheap to share behind an `Arc`.
pub struct AccessLog {
    writer: Option<Mutex<NonBlocking>>,
    _guard: Option<WorkerGuard>,
}

impl AccessLog {
    /// Open `access.log` under `log_dir`, creating the directory.
    pub fn open<P: AsRef<Path>>(log_dir: P) -> Result<Self> {
        let log_dir = log_dir.as_ref();
        std::fs::create_dir_all(log_dir).map_err(|e| {
            Error::config(format!(
                "cannot create log directory {}: {}",
                log_dir.display(),
                e
            ))
        })?;

        let appender = tracing_appender::rolling::never(log_dir, "access.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        Ok(AccessLog {
            writer: Some(Mutex::new(writer)),
            _guard: Some(guard),
        })
    }

    /// A log that drops every event. Used by tests.
    pub fn disabled() -> Self {
        AccessLog {
            writer: None,
            _guard: None,
        }
    }

    pub fn event(&self, event: &AccessEvent<'_>) {
        debug!("access: {}", event);
        self.write_line(&event.to_string());
    }

    pub fn server_start(&self, addr: SocketAddr) {
        self.write_line(&format!("INFO | SERVER_START | listening on {}", addr));
    }

    pub fn server_stop(&self) {
        self.write_line("INFO | SERVER_STOP | server shutting down");
    }

    fn write_line(&self, line: &str) {
        if let Some(writer) = &self.writer {
            let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
            let _ = writeln!(writer.lock(), "{} | {}", stamp, line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn test_event_line_shape() {
        let event = AccessEvent {
            event: "FORWARD",
            client: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 50000)),
            target: "example.org:80",
            request_line: "GET http://example.org/ HTTP/1.1",
            outcome: Outcome::Allowed,
            sent: 2,
            received: 0,
            reason: None,
        };
        assert_eq!(
            event.to_string(),
            "INFO | FORWARD | 127.0.0.1:50000 -> example.org:80 | \
             GET http://example.org/ HTTP/1.1 | ALLOWED | sent=2 recv=0"
        );
    }

    #[test]
    fn test_event_line_with_reason() {
        let event = AccessEvent {
            event: "REQUEST",
            client: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 50000)),
            target: "ads.example:80",
            request_line: "GET http://ads.example/ HTTP/1.1",
            outcome: Outcome::Blocked,
            sent: 0,
            received: 0,
            reason: Some("exact hostname"),
        };
        let line = event.to_string();
        assert!(line.contains("| BLOCKED |"));
        assert!(line.ends_with("| reason=exact hostname"));
    }

    #[test]
    fn test_disabled_log_swallows_events() {
        let log = AccessLog::disabled();
        log.server_start(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1)));
        log.server_stop();
    }
}
