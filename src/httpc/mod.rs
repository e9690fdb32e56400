//! Lazy HTTP client for talking to cluster components.
//!
//! A [`Client`] owns a pooled `reqwest` transport plus per-client defaults
//! (kind tag, base URL, timeout, cancellation). Requests are composed with a
//! [`LazyRequest`], which only records operations. Nothing touches the
//! network until the first read on the [`LazyResponse`] returned by
//! [`LazyRequest::send`]; the request is sent exactly once per response.
//!
//! ```no_run
//! # async fn demo(client: clusterview::httpc::Client) -> Result<(), clusterview::httpc::HttpError> {
//! let members: serde_json::Value = client
//!     .lr()
//!     .set_tls_aware_base_url("10.0.0.1:2379")
//!     .set_timeout(std::time::Duration::from_secs(10))
//!     .get("/pd/api/v1/members")
//!     .read_body_as_json()
//!     .await?;
//! # Ok(()) }
//! ```

mod request;
mod response;

#[cfg(test)]
mod tests;

pub use request::{ClientOp, LazyRequest, MultipartField, RequestBody, RequestOp};
pub use response::{LazyResponse, ResponseHead};

use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{HttpClientSettings, TlsFiles};
use crate::utils::netutil::normalize_url;

/// Default total timeout when the caller does not override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Maximum number of redirects followed.
pub const MAX_REDIRECTS: usize = 10;

/// TCP keep-alive interval for pooled connections.
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Idle pooled connections are dropped after this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Maximum characters of a non-2xx body kept in the error.
const ERROR_BODY_SNAPSHOT: usize = 1024;

/// Errors from the lazy HTTP client.
#[derive(Debug, Clone, Error)]
pub enum HttpError {
    #[error("invalid http client configuration: {0}")]
    Config(String),

    #[error("{kind} request {method} {url} failed: {message}")]
    RequestFailed {
        /// Kind tag of the client that issued the request.
        kind: String,
        method: String,
        url: String,
        /// Status code when the server answered with a non-2xx status.
        status: Option<u16>,
        message: String,
        /// Truncated body of a non-2xx response.
        body: Option<String>,
        timeout: bool,
    },

    #[error("read on closed body")]
    ReadOnClosedBody,
}

impl HttpError {
    /// HTTP status of a non-2xx failure.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::RequestFailed {
                status: Some(code), ..
            } => StatusCode::from_u16(*code).ok(),
            _ => None,
        }
    }

    /// True when the server answered 404.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    /// True when the failure was a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpError::RequestFailed { timeout: true, .. })
    }
}

/// TLS material loaded into memory.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// PEM bundle of trusted CA certificates.
    pub ca_pem: Option<Vec<u8>>,
    /// PEM client certificate followed by its private key.
    pub identity_pem: Option<Vec<u8>>,
}

impl TlsConfig {
    /// Read TLS material from disk.
    pub fn from_files(files: &TlsFiles) -> Result<Self, HttpError> {
        let ca_pem = files.ca_path.as_deref().map(read_pem).transpose()?;
        let identity_pem = match (&files.cert_path, &files.key_path) {
            (Some(cert), Some(key)) => {
                let mut pem = read_pem(cert)?;
                pem.push(b'\n');
                pem.extend(read_pem(key)?);
                Some(pem)
            }
            (None, None) => None,
            _ => {
                return Err(HttpError::Config(
                    "cert_path and key_path must be set together".to_string(),
                ))
            }
        };
        Ok(Self {
            ca_pem,
            identity_pem,
        })
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, HttpError> {
    std::fs::read(path)
        .map_err(|e| HttpError::Config(format!("failed to read {}: {}", path.display(), e)))
}

/// Client construction options.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Tag attached to logs and errors (e.g. the component kind).
    pub kind: String,
    /// TLS settings. `Some` switches base URLs to `https://`.
    pub tls: Option<TlsConfig>,
    /// Total timeout when a request does not set its own.
    pub default_timeout: Duration,
    /// Base URL prepended to relative request URLs.
    pub base_url: Option<String>,
    /// Upper bound of idle pooled connections per host.
    pub max_idle_per_host: usize,
    /// Default cancellation for every request minted by the client.
    pub cancel: Option<CancellationToken>,
}

impl ClientConfig {
    /// Defaults for a client with the given kind tag.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            tls: None,
            default_timeout: DEFAULT_TIMEOUT,
            base_url: None,
            max_idle_per_host: HttpClientSettings::default().max_idle_per_host,
            cancel: None,
        }
    }

    /// Apply shared HTTP settings from configuration.
    pub fn with_settings(mut self, settings: &HttpClientSettings) -> Self {
        self.default_timeout = Duration::from_secs(settings.default_timeout_secs);
        self.max_idle_per_host = settings.max_idle_per_host;
        self
    }

    /// Set the TLS configuration.
    pub fn with_tls(mut self, tls: Option<TlsConfig>) -> Self {
        self.tls = tls;
        self
    }

    /// Set the default base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set the default timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// HTTP client shared by everything that talks to one kind of component.
///
/// Cloning copies the configuration; the connection pool is shared.
#[derive(Debug, Clone)]
pub struct Client {
    kind: String,
    transport: reqwest::Client,
    tls_enabled: bool,
    default_timeout: Duration,
    base_url: Option<String>,
    cancel: CancellationToken,
}

impl Client {
    /// Build a client and its connection pool.
    pub fn new(config: ClientConfig) -> Result<Self, HttpError> {
        let mut builder = reqwest::Client::builder()
            .tcp_keepalive(KEEP_ALIVE)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS));

        if let Some(tls) = &config.tls {
            builder = builder.use_rustls_tls();
            if let Some(ca) = &tls.ca_pem {
                for cert in reqwest::Certificate::from_pem_bundle(ca)
                    .map_err(|e| HttpError::Config(format!("invalid CA bundle: {}", e)))?
                {
                    builder = builder.add_root_certificate(cert);
                }
            }
            if let Some(identity) = &tls.identity_pem {
                let identity = reqwest::Identity::from_pem(identity)
                    .map_err(|e| HttpError::Config(format!("invalid client identity: {}", e)))?;
                builder = builder.identity(identity);
            }
        }

        let transport = builder
            .build()
            .map_err(|e| HttpError::Config(e.to_string()))?;

        let tls_enabled = config.tls.is_some();
        let base_url = config
            .base_url
            .map(|url| normalize_url(tls_enabled, &url));

        Ok(Self {
            kind: config.kind,
            transport,
            tls_enabled,
            default_timeout: config.default_timeout,
            base_url,
            cancel: config.cancel.unwrap_or_default(),
        })
    }

    /// Kind tag used in logs and errors.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Whether TLS is configured.
    pub fn tls_enabled(&self) -> bool {
        self.tls_enabled
    }

    /// Default base URL, already normalized.
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    /// Copy of this client with a different kind tag.
    pub fn with_kind(&self, kind: impl Into<String>) -> Self {
        let mut client = self.clone();
        client.kind = kind.into();
        client
    }

    /// Copy of this client with a different default base URL.
    ///
    /// The URL is rewritten to `https://` when TLS is configured.
    pub fn with_tls_aware_base_url(&self, base_url: &str) -> Self {
        let mut client = self.clone();
        client.base_url = Some(normalize_url(self.tls_enabled, base_url));
        client
    }

    /// Copy of this client with a different default cancellation token.
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        let mut client = self.clone();
        client.cancel = cancel;
        client
    }

    /// Start composing a new request.
    pub fn lr(&self) -> LazyRequest {
        LazyRequest::new(self.clone())
    }

    pub(crate) fn transport(&self) -> &reqwest::Client {
        &self.transport
    }

    pub(crate) fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}
