//! Runtime configuration
//!
//! All options come from the command line; there is no configuration
//! file. Paths named here are read once at startup.

use crate::cache::{DEFAULT_CAPACITY_BYTES, DEFAULT_MAX_ENTRY_BYTES};
use std::path::PathBuf;

/// Resolved proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address
    pub host: String,
    /// Bind port (0 picks an ephemeral port)
    pub port: u16,
    /// Blacklist file path
    pub blacklist: Option<PathBuf>,
    /// Credential file path; authentication is active only when set
    pub auth_file: Option<PathBuf>,
    /// Enable the GET response cache
    pub cache: bool,
    /// Cache budget in bytes
    pub cache_bytes: usize,
    /// Largest single cacheable response
    pub max_entry_bytes: usize,
    /// Directory for the access log
    pub log_dir: PathBuf,
    /// Concurrent connection cap
    pub max_connections: usize,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 8888,
            blacklist: None,
            auth_file: None,
            cache: false,
            cache_bytes: DEFAULT_CAPACITY_BYTES,
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            log_dir: PathBuf::from("logs"),
            max_connections: 10_000,
        }
    }
}
