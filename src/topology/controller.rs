//! Cluster controller REST API.
//!
//! The controller knows the coordinator members, the storage nodes (row
//! and columnar) and the optional microservices (TSO, scheduling).

use std::collections::{BTreeMap, HashSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::model::{
    normalize_store_version, normalize_version, sort_instances, ComponentKind, ComponentStatus,
    InstanceInfo,
};
use super::{Result, TopologyError};
use crate::config::{ControllerConfig, HttpClientSettings};
use crate::httpc::{Client, ClientConfig, HttpError, TlsConfig};
use crate::utils::netutil::{parse_host_port, parse_host_port_from_url};

pub const MEMBERS_PATH: &str = "/pd/api/v1/members";
pub const HEALTH_PATH: &str = "/pd/api/v1/health";
pub const STATUS_PATH: &str = "/pd/api/v1/status";
pub const STORES_PATH: &str = "/pd/api/v1/stores";
pub const REPLICATE_CONFIG_PATH: &str = "/pd/api/v1/config/replicate";
pub const MICROSERVICE_MEMBERS_PATH: &str = "/pd/api/v2/ms/members";

/// Store label values that mark a columnar engine.
const COLUMNAR_ENGINES: [&str; 2] = ["tiflash", "tiflash_compute"];

#[derive(Debug, Clone, Deserialize)]
pub struct MembersResponse {
    #[serde(default)]
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Member {
    #[serde(default)]
    pub name: String,
    pub member_id: u64,
    #[serde(default)]
    pub client_urls: Vec<String>,
    #[serde(default)]
    pub binary_version: String,
    #[serde(default)]
    pub git_hash: String,
    #[serde(default)]
    pub deploy_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberHealth {
    pub member_id: u64,
    #[serde(default)]
    pub health: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    start_timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoresResponse {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub stores: Vec<StoreEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreEntry {
    pub store: Store,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Store {
    #[serde(default)]
    pub id: u64,
    pub address: String,
    #[serde(default)]
    pub status_address: String,
    #[serde(default)]
    pub labels: Vec<StoreLabel>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub git_hash: String,
    #[serde(default)]
    pub deploy_path: String,
    #[serde(default)]
    pub start_timestamp: i64,
    #[serde(default)]
    pub state_name: String,
}

impl Store {
    /// Columnar engines carry an `engine` label.
    pub fn is_columnar(&self) -> bool {
        self.labels
            .iter()
            .any(|l| l.key == "engine" && COLUMNAR_ENGINES.contains(&l.value.as_str()))
    }

    fn label_map(&self) -> BTreeMap<String, String> {
        self.labels
            .iter()
            .map(|l| (l.key.clone(), l.value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreLabel {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ReplicationConfig {
    #[serde(rename = "location-labels", default)]
    location_labels: String,
}

/// Registry entry of a controller microservice.
#[derive(Debug, Clone, Deserialize)]
pub struct MicroServiceMember {
    #[serde(rename = "service-addr")]
    pub service_addr: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "git-hash", default)]
    pub git_hash: String,
    #[serde(rename = "deploy-path", default)]
    pub deploy_path: String,
    #[serde(rename = "start-timestamp", default)]
    pub start_timestamp: i64,
}

/// Storage nodes split by engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreTopology {
    pub kv_stores: Vec<InstanceInfo>,
    pub columnar_stores: Vec<InstanceInfo>,
}

/// Location labels and the labels of every store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreLocation {
    pub location_labels: Vec<String>,
    pub stores: Vec<StoreLabels>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreLabels {
    pub address: String,
    pub labels: BTreeMap<String, String>,
}

/// Client of the cluster controller API.
#[derive(Debug, Clone)]
pub struct ControllerClient {
    client: Client,
}

impl ControllerClient {
    /// Wrap an HTTP client whose base URL points at the controller.
    pub fn new(client: Client) -> Result<Self> {
        match client.base_url() {
            Some(url) if !url.trim_end_matches('/').ends_with("://") => Ok(Self { client }),
            _ => Err(TopologyError::InvalidEndpoint(
                "controller endpoint is empty".to_string(),
            )),
        }
    }

    pub fn from_config(config: &ControllerConfig, http: &HttpClientSettings) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(TopologyError::InvalidEndpoint(
                "controller endpoint is empty".to_string(),
            ));
        }
        let tls = config
            .tls
            .as_ref()
            .map(TlsConfig::from_files)
            .transpose()?;
        let client = Client::new(
            ClientConfig::new(ComponentKind::Coordinator.as_str())
                .with_settings(http)
                .with_tls(tls)
                .with_base_url(config.endpoint.trim()),
        )?;
        Self::new(client)
    }

    /// Underlying HTTP client.
    pub fn http(&self) -> &Client {
        &self.client
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> std::result::Result<T, HttpError> {
        debug!(path, "controller request");
        self.client.lr().get(path).read_body_as_json().await
    }

    fn not_found_or(path: &str, err: HttpError) -> TopologyError {
        if err.is_not_found() {
            TopologyError::NotFound(path.to_string())
        } else {
            TopologyError::RequestFailed(err)
        }
    }

    pub async fn members(&self) -> Result<Vec<Member>> {
        let resp: MembersResponse = self
            .get_json(MEMBERS_PATH)
            .await
            .map_err(|e| Self::not_found_or(MEMBERS_PATH, e))?;
        Ok(resp.members)
    }

    pub async fn health(&self) -> Result<Vec<MemberHealth>> {
        self.get_json(HEALTH_PATH)
            .await
            .map_err(|e| Self::not_found_or(HEALTH_PATH, e))
    }

    /// Start timestamp reported by the member reachable at `client_url`.
    pub async fn member_start_timestamp(&self, client_url: &str) -> Result<i64> {
        let resp: StatusResponse = self
            .client
            .lr()
            .set_tls_aware_base_url(client_url)
            .get(STATUS_PATH)
            .read_body_as_json()
            .await?;
        Ok(resp.start_timestamp)
    }

    pub async fn stores(&self) -> Result<StoresResponse> {
        self.get_json(STORES_PATH)
            .await
            .map_err(|e| TopologyError::ClientRequestFailed {
                kind: ComponentKind::KvStore,
                source: e,
            })
    }

    /// Location labels configured for replica placement.
    pub async fn location_labels(&self) -> Result<Vec<String>> {
        let config: ReplicationConfig = self
            .get_json(REPLICATE_CONFIG_PATH)
            .await
            .map_err(|e| Self::not_found_or(REPLICATE_CONFIG_PATH, e))?;
        Ok(split_labels(&config.location_labels))
    }

    /// Members of a microservice. `None` when the cluster does not run it.
    pub async fn microservice_members(
        &self,
        kind: ComponentKind,
    ) -> Result<Option<Vec<MicroServiceMember>>> {
        let service = match kind {
            ComponentKind::TsoNode => "tso",
            ComponentKind::Scheduler => "scheduling",
            other => {
                return Err(TopologyError::InvalidTopologyData(format!(
                    "{} is not a controller microservice",
                    other
                )))
            }
        };
        let path = format!("{}/{}", MICROSERVICE_MEMBERS_PATH, service);
        match self.get_json::<Vec<MicroServiceMember>>(&path).await {
            Ok(members) => Ok(Some(members)),
            Err(e) if e.is_not_found() => {
                debug!(kind = %kind, "microservice not deployed on this cluster");
                Ok(None)
            }
            Err(e) => Err(TopologyError::ClientRequestFailed { kind, source: e }),
        }
    }

    /// Coordinator members with health-derived status.
    pub async fn fetch_coordinators(&self) -> Result<Vec<InstanceInfo>> {
        let healthy: HashSet<u64> = self
            .health()
            .await?
            .into_iter()
            .filter(|h| h.health)
            .map(|h| h.member_id)
            .collect();

        let members = self.members().await?;
        let mut instances = Vec::with_capacity(members.len());
        for member in members {
            let Some(client_url) = member.client_urls.first() else {
                warn!(name = %member.name, "coordinator member has no client url");
                continue;
            };
            let (host, port) = match parse_host_port_from_url(client_url) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(name = %member.name, url = %client_url, error = %e, "skipping coordinator with invalid client url");
                    continue;
                }
            };
            let start_timestamp = match self.member_start_timestamp(client_url).await {
                Ok(ts) => ts,
                Err(e) => {
                    warn!(name = %member.name, error = %e, "failed to fetch coordinator status");
                    0
                }
            };

            let mut info = InstanceInfo::new(ComponentKind::Coordinator, host, port);
            info.version = normalize_version(&member.binary_version);
            info.git_hash = member.git_hash;
            info.deploy_path = member.deploy_path;
            info.start_timestamp = start_timestamp;
            info.status = if healthy.contains(&member.member_id) {
                ComponentStatus::Up
            } else {
                ComponentStatus::Unreachable
            };
            instances.push(info);
        }
        sort_instances(&mut instances);
        Ok(instances)
    }

    /// Row and columnar storage nodes.
    pub async fn fetch_stores(&self) -> Result<StoreTopology> {
        let resp = self.stores().await?;
        Ok(build_store_topology(resp.stores.into_iter().map(|s| s.store)))
    }

    /// Microservice nodes (`tsoNode` or `scheduler`). Empty when absent.
    pub async fn fetch_microservice(&self, kind: ComponentKind) -> Result<Vec<InstanceInfo>> {
        let Some(members) = self.microservice_members(kind).await? else {
            return Ok(Vec::new());
        };
        let mut instances = Vec::with_capacity(members.len());
        for member in members {
            let (host, port) = match parse_host_port_from_url(&member.service_addr) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(kind = %kind, addr = %member.service_addr, error = %e, "skipping microservice member with invalid address");
                    continue;
                }
            };
            let mut info = InstanceInfo::new(kind, host, port);
            info.version = normalize_version(&member.version);
            info.git_hash = member.git_hash;
            info.deploy_path = member.deploy_path;
            info.start_timestamp = member.start_timestamp;
            // Registered members are serving
            info.status = ComponentStatus::Up;
            instances.push(info);
        }
        sort_instances(&mut instances);
        Ok(instances)
    }

    /// Location labels plus per-store labels.
    pub async fn fetch_store_location(&self) -> Result<StoreLocation> {
        let location_labels = self.location_labels().await?;
        let resp = self.stores().await?;
        let mut stores: Vec<StoreLabels> = resp
            .stores
            .into_iter()
            .map(|s| StoreLabels {
                labels: s.store.label_map(),
                address: s.store.address,
            })
            .collect();
        stores.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(StoreLocation {
            location_labels,
            stores,
        })
    }
}

/// Classify and normalize store records.
pub fn build_store_topology(stores: impl IntoIterator<Item = Store>) -> StoreTopology {
    let mut topology = StoreTopology::default();
    for store in stores {
        let kind = if store.is_columnar() {
            ComponentKind::ColumnarStore
        } else {
            ComponentKind::KvStore
        };
        let (host, port) = match parse_host_port(&store.address) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(kind = %kind, address = %store.address, error = %e, "skipping store with invalid address");
                continue;
            }
        };
        let (_, status_port) = match parse_host_port(&store.status_address) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(kind = %kind, address = %store.status_address, error = %e, "skipping store with invalid status address");
                continue;
            }
        };

        let mut info = InstanceInfo::new(kind, host, port);
        info.status_port = status_port;
        info.version = normalize_store_version(&store.version);
        info.labels = store.label_map();
        info.git_hash = store.git_hash;
        info.deploy_path = store.deploy_path;
        info.start_timestamp = store.start_timestamp;
        info.status = ComponentStatus::from_state_name(&store.state_name);

        match kind {
            ComponentKind::ColumnarStore => topology.columnar_stores.push(info),
            _ => topology.kv_stores.push(info),
        }
    }
    sort_instances(&mut topology.kv_stores);
    sort_instances(&mut topology.columnar_stores);
    topology
}

fn split_labels(labels: &str) -> Vec<String> {
    labels
        .split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
