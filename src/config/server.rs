//! Server-side configuration types.

use std::path::PathBuf;

use serde::Deserialize;

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port for the HTTP API.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 12333,
        }
    }
}

/// Failover SQL proxy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Start the failover proxy in front of sqlEngine instances.
    pub enabled: bool,
    /// Interval between liveness probes of inactive upstreams.
    pub probe_interval_ms: u64,
    /// Timeout for dialing an upstream.
    pub dial_timeout_ms: u64,
    /// Interval between refreshes of the upstream set from topology.
    pub upstream_sync_interval_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_interval_ms: 2_000,
            dial_timeout_ms: 3_000,
            upstream_sync_interval_secs: 10,
        }
    }
}

/// File-swap download configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileSwapSettings {
    /// Directory for encrypted temp files. Defaults to the OS temp dir.
    pub temp_dir: Option<PathBuf>,
}
