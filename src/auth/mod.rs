//! Proxy authentication
//!
//! Validates `Proxy-Authorization: Basic` headers against a credential
//! set loaded once at startup. Password comparison is constant-time.

use crate::{Error, Result};
use base64::Engine;
use std::collections::HashMap;
use std::path::Path;
use subtle::ConstantTimeEq;
use tracing::debug;

/// Outcome of checking a `Proxy-Authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credentials are valid
    Granted,
    /// No credentials were presented
    Challenge,
    /// Credentials were presented but are wrong
    Failed,
}

/// Credential set for Basic proxy authentication. Immutable for the
/// process lifetime.
pub struct AuthGate {
    users: HashMap<String, String>,
}

impl AuthGate {
    /// Load `user:password` lines from a credential file. `#` comments and
    /// blank lines are ignored; the first `:` separates user from
    /// password, so passwords may contain `:`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read auth file {}: {}", path.display(), e))
        })?;
        let gate = Self::parse(&content)?;
        debug!("loaded {} users from {}", gate.users.len(), path.display());
        Ok(gate)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut users = HashMap::new();
        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (user, password) = line.split_once(':').ok_or_else(|| {
                Error::config(format!("auth file line {}: missing ':'", lineno + 1))
            })?;
            users.insert(user.to_string(), password.to_string());
        }
        Ok(AuthGate { users })
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Validate a `Proxy-Authorization` header value.
    pub fn check(&self, header: Option<&str>) -> AuthOutcome {
        let header = match header {
            Some(h) => h,
            None => return AuthOutcome::Challenge,
        };

        let (scheme, encoded) = match header.split_once(' ') {
            Some(pair) => pair,
            None => return AuthOutcome::Failed,
        };
        if !scheme.eq_ignore_ascii_case("basic") {
            return AuthOutcome::Failed;
        }

        let decoded = match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
            Ok(bytes) => bytes,
            Err(_) => return AuthOutcome::Failed,
        };
        let decoded = match String::from_utf8(decoded) {
            Ok(s) => s,
            Err(_) => return AuthOutcome::Failed,
        };

        let (user, password) = match decoded.split_once(':') {
            Some(pair) => pair,
            None => return AuthOutcome::Failed,
        };

        match self.users.get(user) {
            Some(expected) if constant_time_eq(expected.as_bytes(), password.as_bytes()) => {
                AuthOutcome::Granted
            }
            _ => AuthOutcome::Failed,
        }
    }
}

/// Constant-time byte comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
