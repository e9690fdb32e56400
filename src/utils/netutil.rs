//! Address and URL helpers.
//!
//! Every component address in the cluster is a `host:port` pair. IPv6 hosts
//! are bracketed (`[::1]:4000`). Ports are `1..=65535`.

use std::fmt;

use thiserror::Error;

/// Errors produced while parsing addresses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid address {0:?}: missing port")]
    MissingPort(String),

    #[error("invalid address {0:?}: empty host")]
    EmptyHost(String),

    #[error("invalid address {0:?}: bad port")]
    InvalidPort(String),

    #[error("invalid url {url:?}: {message}")]
    InvalidUrl { url: String, message: String },
}

/// A validated `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    /// Parse a `host:port` string.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let (host, port) = parse_host_port(s)?;
        Ok(Self { host, port })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_host_port(&self.host, self.port))
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts.
///
/// Fails when the separator is missing, the port is not numeric, or the port
/// is zero or out of range.
pub fn parse_host_port(s: &str) -> Result<(String, u16), AddressError> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        (host, port)
    } else {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        // An unbracketed host must not itself contain a colon
        if host.contains(':') {
            return Err(AddressError::MissingPort(s.to_string()));
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(AddressError::EmptyHost(s.to_string()));
    }
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AddressError::InvalidPort(s.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| AddressError::InvalidPort(s.to_string()))?;
    if port == 0 {
        return Err(AddressError::InvalidPort(s.to_string()));
    }

    Ok((host.to_string(), port))
}

/// Parse a URL and extract the `host:port` of its authority.
///
/// The URL must carry an explicit port.
pub fn parse_host_port_from_url(s: &str) -> Result<(String, u16), AddressError> {
    let parsed = url::Url::parse(s).map_err(|e| AddressError::InvalidUrl {
        url: s.to_string(),
        message: e.to_string(),
    })?;
    let host = parsed.host_str().ok_or_else(|| AddressError::InvalidUrl {
        url: s.to_string(),
        message: "missing host".to_string(),
    })?;
    let port = parsed.port().ok_or_else(|| AddressError::InvalidUrl {
        url: s.to_string(),
        message: "missing port".to_string(),
    })?;
    // url keeps IPv6 hosts bracketed
    parse_host_port(&format!("{}:{}", host, port))
}

/// Render a host and port, bracketing hosts that contain colons.
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Prepend or rewrite the scheme of `url` depending on whether TLS is on.
///
/// - no scheme: `http://` or `https://` is prepended
/// - `http://` with TLS: rewritten to `https://`
/// - anything else is passed through
///
/// A scheme is only recognised for `http://` and `https://`; any other
/// prefix is treated as part of the host.
pub fn normalize_url(tls_enabled: bool, url: &str) -> String {
    if let Some(rest) = url.strip_prefix("http://") {
        if tls_enabled {
            return format!("https://{}", rest);
        }
        return url.to_string();
    }
    if url.starts_with("https://") {
        return url.to_string();
    }
    if tls_enabled {
        format!("https://{}", url)
    } else {
        format!("http://{}", url)
    }
}
