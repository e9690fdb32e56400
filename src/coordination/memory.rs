//! In-memory coordination store.
//!
//! Used for local runs without etcd and as the test double for topology
//! fetchers. Revisions increase monotonically like etcd's.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CoordinationError, CoordinationStore, KeyValue, Result};

struct Entry {
    value: Vec<u8>,
    create_revision: i64,
    mod_revision: i64,
}

#[derive(Default)]
struct Faults {
    fail_on_get: bool,
    fail_on_delete: bool,
    delay: Option<Duration>,
}

/// Coordination store held entirely in process memory.
#[derive(Default)]
pub struct MemoryCoordinationStore {
    entries: RwLock<BTreeMap<String, Entry>>,
    revision: RwLock<i64>,
    faults: RwLock<Faults>,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience wrapper around [`CoordinationStore::put`] for text values.
    pub async fn put_str(&self, key: &str, value: &str) {
        let _ = self.put(key, value.as_bytes().to_vec()).await;
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn before_request(&self) -> Option<Duration> {
        self.faults.read().await.delay
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl MemoryCoordinationStore {
    pub async fn set_fail_on_get(&self, fail: bool) {
        self.faults.write().await.fail_on_get = fail;
    }

    pub async fn set_fail_on_delete(&self, fail: bool) {
        self.faults.write().await.fail_on_delete = fail;
    }

    /// Delay every request, to exercise caller deadlines.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.faults.write().await.delay = delay;
    }
}

fn to_key_value(key: &str, entry: &Entry) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: entry.value.clone(),
        create_revision: entry.create_revision,
        mod_revision: entry.mod_revision,
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        if let Some(delay) = self.before_request().await {
            tokio::time::sleep(delay).await;
        }
        if self.faults.read().await.fail_on_get {
            return Err(CoordinationError::Request("injected get failure".to_string()));
        }
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| to_key_value(k, e))
            .collect())
    }

    async fn get_prefix_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .get_prefix(prefix)
            .await?
            .into_iter()
            .map(|kv| kv.key)
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        if let Some(delay) = self.before_request().await {
            tokio::time::sleep(delay).await;
        }
        if self.faults.read().await.fail_on_get {
            return Err(CoordinationError::Request("injected get failure".to_string()));
        }
        let entries = self.entries.read().await;
        Ok(entries.get(key).map(|e| to_key_value(key, e)))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut revision = self.revision.write().await;
        *revision += 1;
        let rev = *revision;
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.value = value;
                entry.mod_revision = rev;
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value,
                        create_revision: rev,
                        mod_revision: rev,
                    },
                );
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        if let Some(delay) = self.before_request().await {
            tokio::time::sleep(delay).await;
        }
        if self.faults.read().await.fail_on_delete {
            return Err(CoordinationError::Request(
                "injected delete failure".to_string(),
            ));
        }
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).map_or(0, |_| 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_range_is_ordered_and_bounded() {
        let store = MemoryCoordinationStore::new();
        store.put_str("/topology/sqlEngine/b:1/info", "{}").await;
        store.put_str("/topology/sqlEngine/a:1/info", "{}").await;
        store.put_str("/topology/sqlProxy/a:1/info", "{}").await;
        store.put_str("/topology/sqlEngineX", "{}").await;

        let keys = store.get_prefix_keys("/topology/sqlEngine/").await.unwrap();
        assert_eq!(
            keys,
            ["/topology/sqlEngine/a:1/info", "/topology/sqlEngine/b:1/info"]
        );
    }

    #[tokio::test]
    async fn test_revisions() {
        let store = MemoryCoordinationStore::new();
        store.put_str("/k", "1").await;
        store.put_str("/other", "x").await;
        store.put_str("/k", "2").await;

        let kv = store.get("/k").await.unwrap().unwrap();
        assert_eq!(kv.value_str(), "2");
        assert_eq!(kv.create_revision, 1);
        assert_eq!(kv.mod_revision, 3);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryCoordinationStore::new();
        store.put_str("/k", "1").await;
        assert_eq!(store.delete("/k").await.unwrap(), 1);
        assert_eq!(store.delete("/k").await.unwrap(), 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryCoordinationStore::new();
        store.put_str("/k", "1").await;
        store.set_fail_on_get(true).await;
        assert!(store.get_prefix("/").await.is_err());
        assert!(store.get("/k").await.is_err());

        store.set_fail_on_get(false).await;
        store.set_fail_on_delete(true).await;
        assert!(store.get("/k").await.unwrap().is_some());
        assert!(store.delete("/k").await.is_err());
        assert_eq!(store.len().await, 1);
    }
}
