//! Cluster topology discovery.
//!
//! Two sources are fused into a per-kind list of [`InstanceInfo`]:
//!
//! - the coordination store, where SQL engines, SQL proxies, change-feed
//!   nodes and singleton services register themselves with a TTL
//! - the cluster controller API, which knows coordinators, storage nodes
//!   and microservices
//!
//! Per-entry parse failures are logged and skipped so one bad registration
//! does not hide the rest of the cluster. Microservices the controller does
//! not know (404) are reported as empty lists.

pub mod controller;
pub mod model;
pub mod registry;
pub mod sql_engine;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::coordination::{CoordinationError, CoordinationStore};
use crate::httpc::HttpError;
use crate::utils::netutil::AddressError;

pub use controller::{ControllerClient, StoreLabels, StoreLocation, StoreTopology};
pub use model::{ComponentKind, ComponentStatus, InstanceInfo, SingletonInfo, UnknownKind};

/// Errors from topology discovery.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("etcd request failed: {0}")]
    EtcdRequestFailed(#[source] CoordinationError),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("invalid topology data: {0}")]
    InvalidTopologyData(String),

    #[error("controller request failed: {0}")]
    RequestFailed(#[from] HttpError),

    #[error("{kind} request failed: {source}")]
    ClientRequestFailed {
        kind: ComponentKind,
        #[source]
        source: HttpError,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// Reserved for strict TTL enforcement; stale entries are only logged.
    #[error("instance {0} is not alive")]
    InstanceNotAlive(String),
}

pub type Result<T> = std::result::Result<T, TopologyError>;

/// Entry point for all topology queries.
#[derive(Clone)]
pub struct TopologyDiscoverer {
    store: Arc<dyn CoordinationStore>,
    controller: ControllerClient,
}

impl TopologyDiscoverer {
    pub fn new(store: Arc<dyn CoordinationStore>, controller: ControllerClient) -> Self {
        Self { store, controller }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn controller(&self) -> &ControllerClient {
        &self.controller
    }

    pub async fn sql_engines(&self) -> Result<Vec<InstanceInfo>> {
        sql_engine::fetch_sql_engines(self.store.as_ref()).await
    }

    pub async fn sql_proxies(&self) -> Result<Vec<InstanceInfo>> {
        registry::fetch_registered(self.store.as_ref(), ComponentKind::SqlProxy).await
    }

    pub async fn change_feeds(&self) -> Result<Vec<InstanceInfo>> {
        registry::fetch_registered(self.store.as_ref(), ComponentKind::ChangeFeed).await
    }

    pub async fn coordinators(&self) -> Result<Vec<InstanceInfo>> {
        self.controller.fetch_coordinators().await
    }

    pub async fn stores(&self) -> Result<StoreTopology> {
        self.controller.fetch_stores().await
    }

    pub async fn tso_nodes(&self) -> Result<Vec<InstanceInfo>> {
        self.controller
            .fetch_microservice(ComponentKind::TsoNode)
            .await
    }

    pub async fn schedulers(&self) -> Result<Vec<InstanceInfo>> {
        self.controller
            .fetch_microservice(ComponentKind::Scheduler)
            .await
    }

    /// Singleton service registration (`alerting`, `dashboard`, `metrics`).
    pub async fn singleton(&self, kind: ComponentKind) -> Result<Option<SingletonInfo>> {
        if !kind.is_singleton() {
            return Err(TopologyError::InvalidTopologyData(format!(
                "{} is not a singleton service",
                kind
            )));
        }
        registry::fetch_singleton(self.store.as_ref(), kind).await
    }

    pub async fn store_location(&self) -> Result<StoreLocation> {
        self.controller.fetch_store_location().await
    }

    /// Remove the registration of a SQL engine at `address`.
    pub async fn delete_sql_engine(&self, address: &str) -> Result<()> {
        sql_engine::delete_sql_engine(self.store.as_ref(), address).await
    }

    /// Instances of any kind in a uniform shape.
    ///
    /// Singleton services are returned as a list of at most one entry; they
    /// publish no liveness data and keep the `unreachable` status.
    pub async fn fetch_kind(&self, kind: ComponentKind) -> Result<Vec<InstanceInfo>> {
        match kind {
            ComponentKind::SqlEngine => self.sql_engines().await,
            ComponentKind::SqlProxy => self.sql_proxies().await,
            ComponentKind::ChangeFeed => self.change_feeds().await,
            ComponentKind::Coordinator => self.coordinators().await,
            ComponentKind::KvStore => Ok(self.stores().await?.kv_stores),
            ComponentKind::ColumnarStore => Ok(self.stores().await?.columnar_stores),
            ComponentKind::TsoNode => self.tso_nodes().await,
            ComponentKind::Scheduler => self.schedulers().await,
            ComponentKind::Alerting | ComponentKind::Dashboard | ComponentKind::Metrics => {
                Ok(self
                    .singleton(kind)
                    .await?
                    .map(|s| InstanceInfo::new(kind, s.ip, s.port))
                    .into_iter()
                    .collect())
            }
        }
    }
}
