//! Per-connection context

use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use uuid::Uuid;

/// Pipeline stage a connection is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Reading,
    Gating,
    Forwarding,
    Tunneling,
    Closed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Reading => write!(f, "reading"),
            Stage::Gating => write!(f, "gating"),
            Stage::Forwarding => write!(f, "forwarding"),
            Stage::Tunneling => write!(f, "tunneling"),
            Stage::Closed => write!(f, "closed"),
        }
    }
}

/// Mutable per-connection record, owned by the connection's handler task.
///
/// Byte counters are atomics because the relay pumps both directions
/// concurrently; everything else is only touched from the handler.
pub struct ConnectionContext {
    /// Connection id for log correlation
    pub id: String,
    /// Client remote address
    pub peer: SocketAddr,
    /// Accept time
    pub start: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    stage: Mutex<Stage>,
}

impl ConnectionContext {
    pub fn new(peer: SocketAddr) -> Self {
        ConnectionContext {
            id: Uuid::new_v4().to_string(),
            peer,
            start: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            stage: Mutex::new(Stage::Reading),
        }
    }

    /// Bytes delivered to the client (response payload, or the
    /// upstream-to-client direction of a tunnel).
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes relayed toward the upstream (request payload, or the
    /// client-to-upstream direction of a tunnel).
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    /// Counter handles for the relay pumps.
    pub fn sent_counter(&self) -> &AtomicU64 {
        &self.bytes_sent
    }

    pub fn received_counter(&self) -> &AtomicU64 {
        &self.bytes_received
    }

    pub fn set_stage(&self, stage: Stage) {
        *self.stage.lock() = stage;
    }

    pub fn stage(&self) -> Stage {
        *self.stage.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn peer() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40000))
    }

    #[test]
    fn test_counters() {
        let ctx = ConnectionContext::new(peer());
        ctx.add_sent(100);
        ctx.add_received(50);
        assert_eq!(ctx.bytes_sent(), 100);
        assert_eq!(ctx.bytes_received(), 50);
    }

    #[test]
    fn test_stage_transitions() {
        let ctx = ConnectionContext::new(peer());
        assert_eq!(ctx.stage(), Stage::Reading);
        ctx.set_stage(Stage::Tunneling);
        assert_eq!(ctx.stage(), Stage::Tunneling);
        assert_eq!(ctx.stage().to_string(), "tunneling");
    }
}
