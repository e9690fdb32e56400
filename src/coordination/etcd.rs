//! etcd-backed coordination store.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions};
use tracing::debug;

use super::{CoordinationError, CoordinationStore, KeyValue, Result};

/// Coordination store talking to an etcd cluster.
///
/// `etcd_client::Client` is a cheap handle over a shared channel; each call
/// works on a clone so `&self` methods can issue requests concurrently.
pub struct EtcdCoordinationStore {
    client: Client,
}

impl EtcdCoordinationStore {
    pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> Result<Self> {
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| CoordinationError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn request_error(e: etcd_client::Error) -> CoordinationError {
    CoordinationError::Request(e.to_string())
}

fn to_key_value(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
    }
}

#[async_trait]
impl CoordinationStore for EtcdCoordinationStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(request_error)?;
        debug!(prefix, count = resp.kvs().len(), "etcd range read");
        Ok(resp.kvs().iter().map(to_key_value).collect())
    }

    async fn get_prefix_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix().with_keys_only()))
            .await
            .map_err(request_error)?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| String::from_utf8_lossy(kv.key()).into_owned())
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(request_error)?;
        Ok(resp.kvs().first().map(to_key_value))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut client = self.client.clone();
        client.put(key, value, None).await.map_err(request_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut client = self.client.clone();
        let resp = client.delete(key, None).await.map_err(request_error)?;
        Ok(resp.deleted().max(0) as u64)
    }
}
