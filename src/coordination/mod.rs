//! Coordination store access.
//!
//! Components register themselves in a strongly-consistent key/value store
//! (etcd in production) under `/topology/...` and refresh a TTL key while
//! alive. The topology fetchers only need prefix range reads; deletion of
//! stale registrations needs point deletes.

pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::{CoordinationBackend, CoordinationConfig};

pub use memory::MemoryCoordinationStore;

#[cfg(feature = "etcd")]
pub use etcd::EtcdCoordinationStore;

/// Errors from the coordination store.
#[derive(Debug, Clone, Error)]
pub enum CoordinationError {
    #[error("coordination store connection failed: {0}")]
    Connection(String),

    #[error("coordination store request failed: {0}")]
    Request(String),

    #[error("coordination backend not available: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, CoordinationError>;

/// A single entry returned by a range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
}

impl KeyValue {
    /// Value decoded as UTF-8, lossy.
    pub fn value_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// Key/value operations used for service discovery.
///
/// Range reads return entries in ascending key order.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// All entries whose key starts with `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Keys (without values) starting with `prefix`.
    async fn get_prefix_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// A single entry.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete a key. Returns the number of deleted entries.
    async fn delete(&self, key: &str) -> Result<u64>;
}

/// Build the coordination store selected in configuration.
pub async fn init_coordination(
    config: &CoordinationConfig,
) -> Result<Arc<dyn CoordinationStore>> {
    match config.backend {
        CoordinationBackend::Memory => {
            info!("Coordination store: in-memory");
            Ok(Arc::new(MemoryCoordinationStore::new()))
        }
        #[cfg(feature = "etcd")]
        CoordinationBackend::Etcd => {
            info!(endpoints = ?config.endpoints, "Coordination store: etcd");
            let store = EtcdCoordinationStore::connect(
                &config.endpoints,
                std::time::Duration::from_secs(config.dial_timeout_secs),
            )
            .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "etcd"))]
        CoordinationBackend::Etcd => {
            tracing::error!("etcd coordination store requested but 'etcd' feature is not enabled");
            Err(CoordinationError::Unsupported(
                "etcd feature not enabled".to_string(),
            ))
        }
    }
}
