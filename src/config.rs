//! Session configuration
//!
//! This module holds the per-session configuration handed to
//! [`crate::RobustSession::connect`]: the network address, TLS and IP
//! family preferences, and the retry knobs a host client may want to
//! tune.

use crate::error::{Result, RobustSessionError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// IP address family to use for HTTP connections.
///
/// `Unspec` lets the operating system choose; `V4`/`V6` force the
/// respective family for every connection of the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// Let the OS pick (default)
    #[default]
    Unspec,
    /// Force IPv4
    V4,
    /// Force IPv6
    V6,
}

/// Configuration for a single RobustIRC session
///
/// The `address` is the user-facing network name (e.g. `robustirc.net`),
/// used as the key for the DNS SRV lookup `_robustirc._tcp.<address>`.
///
/// As a testing hook, an `address` containing commas is split, trimmed,
/// and registered verbatim as the `host:port` target list, skipping DNS
/// entirely. A trailing comma therefore registers a single literal
/// target: `"127.0.0.1:60667,"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Network address (SRV lookup key) or comma-separated target list
    pub address: String,

    /// IP family forced for all HTTP connections of this session
    #[serde(default)]
    pub family: AddressFamily,

    /// Whether to verify the TLS certificates of the backend servers
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,

    /// Speak plain `http://` instead of `https://` to the targets
    ///
    /// Only useful for tests and local mock servers. Defaults to false.
    #[serde(default)]
    pub plaintext: bool,

    /// Delay in seconds before a failed DNS SRV resolution is retried
    #[serde(default = "default_resolve_retry_secs")]
    pub resolve_retry_secs: u64,
}

fn default_tls_verify() -> bool {
    true
}

fn default_resolve_retry_secs() -> u64 {
    5
}

impl SessionConfig {
    /// Create a configuration for `address` with all defaults.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            family: AddressFamily::default(),
            tls_verify: default_tls_verify(),
            plaintext: false,
            resolve_retry_secs: default_resolve_retry_secs(),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RobustSessionError::Config`] if the address is empty.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(anyhow::anyhow!(RobustSessionError::Config(
                "address must not be empty".to_string()
            )));
        }
        Ok(())
    }

    pub(crate) fn resolve_retry(&self) -> Duration {
        Duration::from_secs(self.resolve_retry_secs)
    }
}
