//! Palisade - filtering forward HTTP/1.1 proxy
//!
//! Accepts client TCP connections and handles each as either a plaintext
//! HTTP request forwarded on the client's behalf or a CONNECT request
//! tunneled opaquely, behind a blacklist gate, optional Basic proxy
//! authentication, and an in-memory LRU cache for GET responses.
//!
//! # Architecture
//!
//! ```text
//! +----------+     +-----------+     +--------------------+
//! | listener | --> |  handler  | --> | acl / auth / cache |
//! +----------+     +-----+-----+     +--------------------+
//!                        |
//!            +-----------+-----------+
//!            |                       |
//!      +-----v-----+           +-----v-----+
//!      |   http    |           |   relay   |
//!      | (parsing) |           | (tunnels) |
//!      +-----------+           +-----------+
//! ```
//!
//! One request per client connection; handlers are independent fault
//! domains sharing only the ACL, credentials, cache, and counters.

pub mod acl;
pub mod auth;
pub mod cache;
pub mod common;
pub mod config;
pub mod handler;
pub mod http;
pub mod listener;
pub mod relay;
pub mod stats;

pub use common::error::{Error, Result};
pub use config::Config;

use acl::Acl;
use auth::AuthGate;
use cache::ResponseCache;
use handler::Handler;
use listener::Listener;
use stats::{AccessLog, Stats};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Proxy instance: loaded policy, bound socket, shared state.
pub struct Server {
    listener: Listener,
    stats: Arc<Stats>,
    access: Arc<AccessLog>,
}

impl Server {
    /// Load policy files and bind the listening socket.
    ///
    /// Unreadable or invalid policy files surface as [`Error::Config`];
    /// a bind failure surfaces as [`Error::Io`]. Callers map these to
    /// their respective exit codes.
    pub async fn bind(config: Config) -> Result<Server> {
        let acl = match &config.blacklist {
            Some(path) => {
                let acl = Acl::from_file(path)?;
                info!("loaded {} blacklist rules", acl.rule_count());
                Arc::new(acl)
            }
            None => Arc::new(Acl::new()),
        };

        let auth = match &config.auth_file {
            Some(path) => {
                let gate = AuthGate::from_file(path)?;
                info!("authentication enabled ({} users)", gate.user_count());
                Some(Arc::new(gate))
            }
            None => None,
        };

        let cache = if config.cache {
            info!(
                "response cache enabled ({} MiB budget)",
                config.cache_bytes / (1024 * 1024)
            );
            Some(ResponseCache::new(config.cache_bytes, config.max_entry_bytes))
        } else {
            None
        };

        let stats = Arc::new(Stats::new());
        let access = Arc::new(AccessLog::open(&config.log_dir)?);

        let handler = Arc::new(Handler::new(
            acl,
            auth,
            cache,
            stats.clone(),
            access.clone(),
        ));

        let listener = Listener::bind(
            &config.listen_addr(),
            handler,
            stats.clone(),
            config.max_connections,
        )
        .await?;

        Ok(Server {
            listener,
            stats,
            access,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the accept loop fails or a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let Server {
            listener,
            stats,
            access,
        } = self;

        access.server_start(listener.local_addr()?);
        stats.start_ticker();

        let result = tokio::select! {
            res = listener.run() => res,
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                Ok(())
            }
        };

        access.server_stop();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
