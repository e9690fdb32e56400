//! Component model shared by all topology fetchers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Every kind of cluster component the dashboard knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComponentKind {
    SqlEngine,
    KvStore,
    ColumnarStore,
    Coordinator,
    TsoNode,
    Scheduler,
    ChangeFeed,
    SqlProxy,
    Alerting,
    Dashboard,
    Metrics,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 11] = [
        ComponentKind::SqlEngine,
        ComponentKind::KvStore,
        ComponentKind::ColumnarStore,
        ComponentKind::Coordinator,
        ComponentKind::TsoNode,
        ComponentKind::Scheduler,
        ComponentKind::ChangeFeed,
        ComponentKind::SqlProxy,
        ComponentKind::Alerting,
        ComponentKind::Dashboard,
        ComponentKind::Metrics,
    ];

    /// Name used in coordination-store keys and HTTP routes.
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::SqlEngine => "sqlEngine",
            ComponentKind::KvStore => "kvStore",
            ComponentKind::ColumnarStore => "columnarStore",
            ComponentKind::Coordinator => "coordinator",
            ComponentKind::TsoNode => "tsoNode",
            ComponentKind::Scheduler => "scheduler",
            ComponentKind::ChangeFeed => "changeFeed",
            ComponentKind::SqlProxy => "sqlProxy",
            ComponentKind::Alerting => "alerting",
            ComponentKind::Dashboard => "dashboard",
            ComponentKind::Metrics => "metrics",
        }
    }

    /// Value of the `TYPE` column in the cluster system tables.
    ///
    /// Singleton services never appear in those tables.
    pub fn sql_type_name(&self) -> Option<&'static str> {
        match self {
            ComponentKind::SqlEngine => Some("tidb"),
            ComponentKind::KvStore => Some("tikv"),
            ComponentKind::ColumnarStore => Some("tiflash"),
            ComponentKind::Coordinator => Some("pd"),
            ComponentKind::TsoNode => Some("tso"),
            ComponentKind::Scheduler => Some("scheduling"),
            ComponentKind::SqlProxy => Some("tiproxy"),
            ComponentKind::ChangeFeed => Some("ticdc"),
            ComponentKind::Alerting | ComponentKind::Dashboard | ComponentKind::Metrics => None,
        }
    }

    /// Inverse of [`sql_type_name`](Self::sql_type_name), case-insensitive.
    pub fn from_sql_type_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.sql_type_name() == Some(name.as_str()))
    }

    /// True for kinds that publish a single record instead of a list.
    pub fn is_singleton(&self) -> bool {
        matches!(
            self,
            ComponentKind::Alerting | ComponentKind::Dashboard | ComponentKind::Metrics
        )
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown component kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for ComponentKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Liveness of a component instance.
///
/// Encoded on the wire as its integer discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ComponentStatus {
    #[default]
    Unreachable = 0,
    Up = 1,
    Tombstone = 2,
    Offline = 3,
    Down = 4,
}

impl ComponentStatus {
    /// Map a store state name reported by the controller.
    pub fn from_state_name(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "up" => ComponentStatus::Up,
            "tombstone" => ComponentStatus::Tombstone,
            "offline" => ComponentStatus::Offline,
            "down" => ComponentStatus::Down,
            _ => ComponentStatus::Unreachable,
        }
    }
}

impl TryFrom<u8> for ComponentStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ComponentStatus::Unreachable),
            1 => Ok(ComponentStatus::Up),
            2 => Ok(ComponentStatus::Tombstone),
            3 => Ok(ComponentStatus::Offline),
            4 => Ok(ComponentStatus::Down),
            other => Err(other),
        }
    }
}

impl Serialize for ComponentStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for ComponentStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        ComponentStatus::try_from(raw)
            .map_err(|v| serde::de::Error::custom(format!("invalid component status {}", v)))
    }
}

/// One running instance of a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub kind: ComponentKind,
    pub ip: String,
    pub port: u16,
    /// Zero when the component has no separate status port.
    #[serde(default)]
    pub status_port: u16,
    #[serde(default)]
    pub git_hash: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub deploy_path: String,
    #[serde(default)]
    pub status: ComponentStatus,
    /// Unix seconds, 0 when unknown.
    #[serde(default)]
    pub start_timestamp: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl InstanceInfo {
    pub fn new(kind: ComponentKind, ip: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            ip: ip.into(),
            port,
            status_port: 0,
            git_hash: String::new(),
            version: String::new(),
            deploy_path: String::new(),
            status: ComponentStatus::Unreachable,
            start_timestamp: 0,
            labels: BTreeMap::new(),
        }
    }

    /// `host:port` of the instance.
    pub fn address(&self) -> String {
        crate::utils::netutil::format_host_port(&self.ip, self.port)
    }
}

/// Address of a singleton service (alerting, dashboard, metrics).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingletonInfo {
    pub ip: String,
    pub port: u16,
}

impl SingletonInfo {
    pub fn address(&self) -> String {
        crate::utils::netutil::format_host_port(&self.ip, self.port)
    }
}

/// Trim and force a leading `v`.
pub fn normalize_version(version: &str) -> String {
    let version = version.trim();
    if version.is_empty() || version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{}", version)
    }
}

/// Trim and prefix `v` unless already present, even when empty.
///
/// Store versions always carry the prefix.
pub fn normalize_store_version(version: &str) -> String {
    let version = version.trim();
    if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{}", version)
    }
}

/// Sort by (ip, port) ascending.
pub fn sort_instances(instances: &mut [InstanceInfo]) {
    instances.sort_by(|a, b| a.ip.cmp(&b.ip).then(a.port.cmp(&b.port)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in ComponentKind::ALL {
            assert_eq!(kind.as_str().parse::<ComponentKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert!("tidb".parse::<ComponentKind>().is_err());
    }

    #[test]
    fn test_sql_type_names() {
        assert_eq!(
            ComponentKind::from_sql_type_name("TiFlash"),
            Some(ComponentKind::ColumnarStore)
        );
        assert_eq!(ComponentKind::from_sql_type_name("pd"), Some(ComponentKind::Coordinator));
        assert_eq!(ComponentKind::from_sql_type_name("grafana"), None);
        assert_eq!(ComponentKind::Metrics.sql_type_name(), None);
    }

    #[test]
    fn test_status_from_state_name() {
        assert_eq!(ComponentStatus::from_state_name(" Up "), ComponentStatus::Up);
        assert_eq!(
            ComponentStatus::from_state_name("Tombstone"),
            ComponentStatus::Tombstone
        );
        assert_eq!(ComponentStatus::from_state_name("offline"), ComponentStatus::Offline);
        assert_eq!(ComponentStatus::from_state_name("Down"), ComponentStatus::Down);
        assert_eq!(
            ComponentStatus::from_state_name("Disconnected"),
            ComponentStatus::Unreachable
        );
        assert_eq!(
            ComponentStatus::from_state_name("Preparing"),
            ComponentStatus::Unreachable
        );
    }

    #[test]
    fn test_instance_wire_shape() {
        let mut info = InstanceInfo::new(ComponentKind::KvStore, "10.0.0.2", 20160);
        info.status = ComponentStatus::Up;
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["kind"], "kvStore");
        assert_eq!(value["port"], 20160);
        assert_eq!(value["status"], 1);

        let back: InstanceInfo = serde_json::from_value(value).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_older_instance_shape_rejected() {
        // String port and string status belong to the retired shape
        let old = r#"{"kind":"kvStore","ip":"10.0.0.2","port":"20160","status":"up"}"#;
        assert!(serde_json::from_str::<InstanceInfo>(old).is_err());

        let old_status = r#"{"kind":"kvStore","ip":"10.0.0.2","port":20160,"status":"up"}"#;
        assert!(serde_json::from_str::<InstanceInfo>(old_status).is_err());

        let bad_status = r#"{"kind":"kvStore","ip":"10.0.0.2","port":20160,"status":9}"#;
        assert!(serde_json::from_str::<InstanceInfo>(bad_status).is_err());
    }

    #[test]
    fn test_normalize_version() {
        assert_eq!(normalize_version(" 7.5.0\n"), "v7.5.0");
        assert_eq!(normalize_version("v7.5.0"), "v7.5.0");
        assert_eq!(normalize_version(""), "");
    }

    #[test]
    fn test_normalize_store_version_never_empty() {
        assert_eq!(normalize_store_version(" 7.5.0\n"), "v7.5.0");
        assert_eq!(normalize_store_version("v7.5.0"), "v7.5.0");
        assert_eq!(normalize_store_version(""), "v");
        assert_eq!(normalize_store_version("  "), "v");
    }

    #[test]
    fn test_sort_instances() {
        let mut list = vec![
            InstanceInfo::new(ComponentKind::SqlEngine, "10.0.0.2", 4000),
            InstanceInfo::new(ComponentKind::SqlEngine, "10.0.0.1", 4001),
            InstanceInfo::new(ComponentKind::SqlEngine, "10.0.0.1", 4000),
        ];
        sort_instances(&mut list);
        let addrs: Vec<String> = list.iter().map(InstanceInfo::address).collect();
        assert_eq!(addrs, ["10.0.0.1:4000", "10.0.0.1:4001", "10.0.0.2:4000"]);
    }

    #[test]
    fn test_ipv6_address_formatting() {
        let info = InstanceInfo::new(ComponentKind::SqlEngine, "::1", 4000);
        assert_eq!(info.address(), "[::1]:4000");
    }
}
