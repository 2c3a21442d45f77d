//! Connection counters and access-event logging

mod access;

pub use access::{AccessEvent, AccessLog, Outcome};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shared traffic and connection counters, owned by the listener and
/// updated by handlers with atomic increments.
pub struct Stats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    allowed_requests: AtomicU64,
    blocked_requests: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            allowed_requests: AtomicU64::new(0),
            blocked_requests: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn record_connection_start(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_end(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_allowed(&self, sent: u64, received: u64) {
        self.allowed_requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            allowed_requests: self.allowed_requests.load(Ordering::Relaxed),
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Log a summary line every minute.
    pub fn start_ticker(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!("{}", this.snapshot());
            }
        });
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub active_connections: u64,
    pub total_connections: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Active: {} | Total: {} | Allowed: {} | Blocked: {} | Sent: {} bytes | Received: {} bytes",
            self.active_connections,
            self.total_connections,
            self.allowed_requests,
            self.blocked_requests,
            self.bytes_sent,
            self.bytes_received,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counting() {
        let stats = Stats::new();
        stats.record_connection_start();
        stats.record_connection_start();
        stats.record_connection_end();

        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.active_connections, 1);
    }

    #[test]
    fn test_traffic_totals() {
        let stats = Stats::new();
        stats.record_allowed(100, 40);
        stats.record_allowed(50, 0);
        stats.record_blocked();

        let snap = stats.snapshot();
        assert_eq!(snap.allowed_requests, 2);
        assert_eq!(snap.blocked_requests, 1);
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.bytes_received, 40);
    }

    #[test]
    fn test_snapshot_display() {
        let stats = Stats::new();
        stats.record_connection_start();
        let line = stats.snapshot().to_string();
        assert!(line.starts_with("Active: 1 | Total: 1 |"));
    }
}
