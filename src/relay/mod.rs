//! Bidirectional byte relay
//!
//! Pumps both directions of an established tunnel concurrently. EOF on
//! one direction propagates a write-shutdown (half-close) to the other
//! side while the opposite pump keeps running; any I/O error or an idle
//! watchdog expiry tears down both directions at once.

use crate::common::ConnectionContext;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Per-direction copy buffer.
pub const RELAY_BUF_SIZE: usize = 4096;

/// The relay is torn down after this long with no bytes in either
/// direction.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Why a relay ended.
#[derive(Debug)]
pub enum RelayCause {
    /// Both directions reached EOF and were drained
    Eof,
    /// No bytes moved in either direction for [`IDLE_TIMEOUT`]
    IdleTimeout,
    /// A read or write failed; both directions were closed
    Error(io::Error),
}

impl RelayCause {
    pub fn is_clean(&self) -> bool {
        matches!(self, RelayCause::Eof)
    }
}

impl fmt::Display for RelayCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayCause::Eof => write!(f, "eof"),
            RelayCause::IdleTimeout => write!(f, "idle timeout"),
            RelayCause::Error(e) => write!(f, "io error: {}", e),
        }
    }
}

/// Relay bytes between client and upstream until both directions finish
/// or the connection faults. Returns (client-to-upstream bytes,
/// upstream-to-client bytes, cause).
pub async fn relay<A, B>(client: A, upstream: B, ctx: &ConnectionContext) -> (u64, u64, RelayCause)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

    let to_upstream = AtomicU64::new(0);
    let to_client = AtomicU64::new(0);
    let last_activity = Mutex::new(Instant::now());

    let pumps = async {
        tokio::try_join!(
            pump(
                &mut client_r,
                &mut upstream_w,
                &to_upstream,
                ctx.received_counter(),
                &last_activity,
            ),
            pump(
                &mut upstream_r,
                &mut client_w,
                &to_client,
                ctx.sent_counter(),
                &last_activity,
            ),
        )
    };
    tokio::pin!(pumps);

    let cause = tokio::select! {
        res = &mut pumps => match res {
            Ok(_) => RelayCause::Eof,
            Err(e) => RelayCause::Error(e),
        },
        _ = watchdog(&last_activity) => RelayCause::IdleTimeout,
    };

    (
        to_upstream.load(Ordering::Relaxed),
        to_client.load(Ordering::Relaxed),
        cause,
    )
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    total: &AtomicU64,
    ctx_counter: &AtomicU64,
    last_activity: &Mutex<Instant>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // Propagate the half-close; the opposite pump keeps running.
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        total.fetch_add(n as u64, Ordering::Relaxed);
        ctx_counter.fetch_add(n as u64, Ordering::Relaxed);
        *last_activity.lock() = Instant::now();
    }
}

async fn watchdog(last_activity: &Mutex<Instant>) {
    loop {
        let idle = last_activity.lock().elapsed();
        if idle >= IDLE_TIMEOUT {
            return;
        }
        tokio::time::sleep(IDLE_TIMEOUT - idle).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use tokio::io::duplex;

    fn ctx() -> ConnectionContext {
        ConnectionContext::new(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1)))
    }

    /// Bytes read on one side equal bytes written on the other.
    #[tokio::test]
    async fn test_byte_conservation() {
        let (client_near, client_far) = duplex(64 * 1024);
        let (upstream_near, upstream_far) = duplex(64 * 1024);

        let ctx = ctx();
        let relay_task = tokio::spawn(async move {
            let ctx = ctx;
            let out = relay(client_far, upstream_far, &ctx).await;
            (out.0, out.1, ctx.bytes_sent(), ctx.bytes_received())
        });

        let payload_up = vec![7u8; 10_000];
        let payload_down = vec![9u8; 5_000];

        let (mut client_r, mut client_w) = tokio::io::split(client_near);
        let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream_near);

        client_w.write_all(&payload_up).await.unwrap();
        client_w.shutdown().await.unwrap();

        let mut got_up = Vec::new();
        upstream_r.read_to_end(&mut got_up).await.unwrap();
        assert_eq!(got_up, payload_up);

        upstream_w.write_all(&payload_down).await.unwrap();
        upstream_w.shutdown().await.unwrap();

        let mut got_down = Vec::new();
        client_r.read_to_end(&mut got_down).await.unwrap();
        assert_eq!(got_down, payload_down);

        let (ab, ba, ctx_sent, ctx_recv) = relay_task.await.unwrap();
        assert_eq!(ab, 10_000);
        assert_eq!(ba, 5_000);
        assert_eq!(ctx_sent, 5_000);
        assert_eq!(ctx_recv, 10_000);
    }

    /// Client EOF half-closes the upstream side but the return direction
    /// still delivers.
    #[tokio::test]
    async fn test_half_close_keeps_return_path() {
        let (client_near, client_far) = duplex(1024);
        let (upstream_near, upstream_far) = duplex(1024);

        let ctx = ctx();
        let relay_task = tokio::spawn(async move {
            let ctx = ctx;
            let (_, _, cause) = relay(client_far, upstream_far, &ctx).await;
            cause.is_clean()
        });

        let (mut client_r, mut client_w) = tokio::io::split(client_near);
        let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream_near);

        // Client closes its write side immediately.
        client_w.shutdown().await.unwrap();

        // Upstream observes the propagated EOF...
        let mut sink = Vec::new();
        upstream_r.read_to_end(&mut sink).await.unwrap();
        assert!(sink.is_empty());

        // ...and can still push bytes back to the client.
        upstream_w.write_all(b"late data").await.unwrap();
        upstream_w.shutdown().await.unwrap();

        let mut got = Vec::new();
        client_r.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"late data");

        assert!(relay_task.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let (_client_near, client_far) = duplex(64);
        let (_upstream_near, upstream_far) = duplex(64);

        let ctx = ctx();
        let (_, _, cause) = relay(client_far, upstream_far, &ctx).await;
        assert!(matches!(cause, RelayCause::IdleTimeout));
    }
}
