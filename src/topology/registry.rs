//! Coordination-store registry parsing.
//!
//! Components publish two keys per instance under `/topology/<kind>/`:
//!
//! - `<host:port>/info`: JSON registration blob
//! - `<host:port>/ttl`: unix nanoseconds, refreshed while the process lives
//!
//! Singleton services publish one JSON blob at `/topology/<kind>`.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use super::model::{
    normalize_version, sort_instances, ComponentKind, ComponentStatus, InstanceInfo,
    SingletonInfo,
};
use super::{Result, TopologyError};
use crate::coordination::{CoordinationStore, KeyValue};
use crate::utils::netutil::parse_host_port;

/// Deadline for a single range read.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Root of all registrations.
pub const TOPOLOGY_ROOT: &str = "/topology";

/// Prefix holding per-instance registrations of `kind`, with trailing slash.
pub fn kind_prefix(kind: ComponentKind) -> String {
    format!("{}/{}/", TOPOLOGY_ROOT, kind.as_str())
}

/// Key of a singleton registration.
pub fn singleton_key(kind: ComponentKind) -> String {
    format!("{}/{}", TOPOLOGY_ROOT, kind.as_str())
}

/// Maximum TTL age before an entry is reported as stale.
pub fn ttl_threshold(kind: ComponentKind) -> Duration {
    match kind {
        ComponentKind::Metrics => Duration::from_secs(90),
        _ => Duration::from_secs(45),
    }
}

/// Registration blob stored under `<host:port>/info`.
#[derive(Debug, Deserialize)]
struct RegistrationInfo {
    #[serde(default)]
    version: String,
    #[serde(default)]
    git_hash: String,
    #[serde(default)]
    deploy_path: String,
    #[serde(default)]
    status_port: u16,
    #[serde(default)]
    start_timestamp: i64,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

/// Result of scanning one registry prefix.
#[derive(Debug, Default)]
pub struct RegistryScan {
    /// Instances with a parsed `info` entry, keyed by `host:port`.
    pub infos: BTreeMap<String, InstanceInfo>,
    /// Addresses with a parsed `ttl` entry.
    pub alive: HashSet<String>,
}

impl RegistryScan {
    /// Apply liveness and return instances sorted by (ip, port).
    pub fn into_instances(self) -> Vec<InstanceInfo> {
        let alive = self.alive;
        let mut instances: Vec<InstanceInfo> = self
            .infos
            .into_iter()
            .map(|(address, mut info)| {
                if alive.contains(&address) {
                    info.status = ComponentStatus::Up;
                }
                info
            })
            .collect();
        sort_instances(&mut instances);
        instances
    }

    /// Add entries of `other` whose address is not known yet.
    pub fn merge_first_wins(&mut self, other: RegistryScan) {
        for (address, info) in other.infos {
            self.infos.entry(address).or_insert(info);
        }
        self.alive.extend(other.alive);
    }
}

/// Current time in unix nanoseconds.
pub fn now_nanos() -> i128 {
    let now = chrono::Utc::now();
    now.timestamp() as i128 * 1_000_000_000 + now.timestamp_subsec_nanos() as i128
}

/// Parse the entries returned by a range read of `prefix`.
///
/// Malformed keys or values are logged and skipped.
pub fn scan_entries(
    kind: ComponentKind,
    prefix: &str,
    entries: &[KeyValue],
    now_nanos: i128,
) -> RegistryScan {
    let threshold = ttl_threshold(kind).as_nanos() as i128;
    let mut scan = RegistryScan::default();

    for entry in entries {
        let value = entry.value_str();
        let Some(rest) = entry.key.strip_prefix(prefix) else {
            warn!(key = %entry.key, value = %value, "ignoring key outside of prefix");
            continue;
        };
        let Some((address, field)) = rest.split_once('/') else {
            warn!(key = %entry.key, value = %value, "ignoring malformed topology key");
            continue;
        };
        let (host, port) = match parse_host_port(address) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(key = %entry.key, value = %value, error = %e, "ignoring topology key with invalid address");
                continue;
            }
        };

        match field {
            "info" => {
                let registration: RegistrationInfo = match serde_json::from_slice(&entry.value) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(key = %entry.key, value = %value, error = %e, "failed to parse topology info");
                        continue;
                    }
                };
                let mut info = InstanceInfo::new(kind, host, port);
                info.version = normalize_version(&registration.version);
                info.git_hash = registration.git_hash;
                info.deploy_path = registration.deploy_path;
                info.status_port = registration.status_port;
                info.start_timestamp = registration.start_timestamp;
                info.labels = registration.labels;
                scan.infos.insert(address.to_string(), info);
            }
            "ttl" => {
                let ttl: u64 = match value.trim().parse() {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(key = %entry.key, value = %value, error = %e, "failed to parse topology ttl");
                        continue;
                    }
                };
                let age = now_nanos - ttl as i128;
                if age > threshold {
                    warn!(
                        kind = %kind,
                        address,
                        age_secs = (age / 1_000_000_000) as i64,
                        "topology ttl is stale, the clock of this host may be skewed"
                    );
                }
                scan.alive.insert(address.to_string());
            }
            _ => {
                warn!(key = %entry.key, value = %value, "ignoring unknown topology key");
            }
        }
    }

    scan
}

/// Range-read `prefix` with the fetch deadline.
pub async fn read_prefix(store: &dyn CoordinationStore, prefix: &str) -> Result<Vec<KeyValue>> {
    match tokio::time::timeout(FETCH_TIMEOUT, store.get_prefix(prefix)).await {
        Ok(result) => result.map_err(TopologyError::EtcdRequestFailed),
        Err(_) => Err(TopologyError::Timeout {
            operation: format!("range read of {}", prefix),
            after: FETCH_TIMEOUT,
        }),
    }
}

/// Fetch and parse all registrations of `kind` under `/topology/<kind>/`.
pub async fn fetch_registered(
    store: &dyn CoordinationStore,
    kind: ComponentKind,
) -> Result<Vec<InstanceInfo>> {
    let prefix = kind_prefix(kind);
    let entries = read_prefix(store, &prefix).await?;
    Ok(scan_entries(kind, &prefix, &entries, now_nanos()).into_instances())
}

/// Fetch a singleton registration. Missing or malformed entries yield `None`.
pub async fn fetch_singleton(
    store: &dyn CoordinationStore,
    kind: ComponentKind,
) -> Result<Option<SingletonInfo>> {
    let key = singleton_key(kind);
    let entry = match tokio::time::timeout(FETCH_TIMEOUT, store.get(&key)).await {
        Ok(result) => result.map_err(TopologyError::EtcdRequestFailed)?,
        Err(_) => {
            return Err(TopologyError::Timeout {
                operation: format!("read of {}", key),
                after: FETCH_TIMEOUT,
            })
        }
    };
    let Some(entry) = entry else {
        warn!(key = %key, "singleton topology key not found");
        return Ok(None);
    };
    match serde_json::from_slice::<SingletonInfo>(&entry.value) {
        Ok(info) if !info.ip.is_empty() && info.port != 0 => Ok(Some(info)),
        Ok(_) => {
            warn!(key = %key, value = %entry.value_str(), "singleton topology has no address");
            Ok(None)
        }
        Err(e) => {
            warn!(key = %key, value = %entry.value_str(), error = %e, "failed to parse singleton topology");
            Ok(None)
        }
    }
}
