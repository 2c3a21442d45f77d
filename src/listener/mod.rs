//! Accept loop and per-connection lifecycle

use crate::common::net::configure_tcp_stream;
use crate::handler::Handler;
use crate::stats::Stats;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info};

/// Bound listening socket plus the shared handler state.
///
/// The accept loop holds a semaphore permit per live connection; at the
/// cap it stops accepting, which backpressures at the TCP level instead
/// of refusing connections.
pub struct Listener {
    listener: TcpListener,
    handler: Arc<Handler>,
    stats: Arc<Stats>,
    limit: Arc<Semaphore>,
}

impl Listener {
    pub async fn bind(
        addr: &str,
        handler: Arc<Handler>,
        stats: Arc<Stats>,
        max_connections: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Listener {
            listener,
            handler,
            stats,
            limit: Arc::new(Semaphore::new(max_connections)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        info!("proxy listening on {}", self.local_addr()?);

        loop {
            let permit = self
                .limit
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::internal("connection semaphore closed"))?;

            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept error: {}", e);
                    continue;
                }
            };
            configure_tcp_stream(&stream);

            self.stats.record_connection_start();
            let handler = self.handler.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                // Each handler is its own fault domain: a panic is caught
                // here, logged, and must not take down the process.
                let task = tokio::spawn(async move { handler.handle(stream, peer).await });
                if let Err(e) = task.await {
                    if e.is_panic() {
                        error!("FATAL: handler for {} panicked: {}", peer, e);
                    }
                }
                stats.record_connection_end();
                drop(permit);
            });
        }
    }
}
