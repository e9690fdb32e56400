//! Host inventory built from the cluster system tables.
//!
//! Three tables are read: `CLUSTER_LOAD` (memory and cpu usage),
//! `CLUSTER_HARDWARE` (cpu model and disk partitions) and `CLUSTER_CONFIG`
//! (data directory of every instance). Rows are folded into one
//! [`HostInfo`] per hostname; a failing table leaves the others usable and
//! is reported as a warning.

pub mod merge;
pub mod query;

#[cfg(feature = "mysql")]
pub mod mysql;


pub use query::ClusterTable;

#[cfg(feature = "mysql")]
pub use mysql::MysqlClusterTables;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ClusterSqlConfig;
use crate::topology::ComponentKind;
use merge::HostMap;

#[derive(Debug, Error)]
pub enum HostInfoError {
    #[error("cluster SQL endpoint is not configured")]
    NotConfigured,

    #[error("cluster table query failed: {0}")]
    Query(String),

    #[cfg(feature = "mysql")]
    #[error("cluster SQL error: {0}")]
    Sql(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, HostInfoError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub arch: String,
    pub logical_cores: u32,
    pub physical_cores: u32,
}

/// Fractions in `0.0..=1.0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub idle: f64,
    pub system: f64,
}

/// Bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub used: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub path: String,
    pub fs_type: String,
    pub free: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInstance {
    pub kind: ComponentKind,
    /// Lower-cased key into [`HostInfo::partitions`], empty when unmatched.
    pub matched_partition_path_lower: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub cpu_info: Option<CpuInfo>,
    pub cpu_usage: Option<CpuUsage>,
    pub memory_usage: Option<MemoryUsage>,
    /// Keyed by lower-cased mount path.
    pub partitions: BTreeMap<String, PartitionInfo>,
    /// Keyed by `host:port`.
    pub instances: BTreeMap<String, HostInstance>,
    /// Kind whose hardware report populated `partitions`.
    pub partition_provider_kind: Option<ComponentKind>,
}

impl HostInfo {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Default::default()
        }
    }
}

/// One aggregated row of `CLUSTER_HARDWARE` or `CLUSTER_LOAD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTableRow {
    /// `TYPE` column, e.g. `tikv`.
    pub instance_type: String,
    pub instance: String,
    pub device_type: String,
    pub device_name: String,
    /// `NAME -> VALUE` pairs as a JSON object.
    pub json_value: String,
}

/// One row of `CLUSTER_CONFIG`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfigRow {
    pub instance_type: String,
    pub instance: String,
    pub key: String,
    pub value: String,
}

/// Read access to the cluster system tables.
///
/// Device rows must come back in query order (see [`merge::sort_rows`]).
#[async_trait]
pub trait ClusterTableSource: Send + Sync {
    async fn device_rows(
        &self,
        table: ClusterTable,
        device_types: &[&str],
    ) -> Result<Vec<ClusterTableRow>>;

    async fn instance_mounts(&self) -> Result<Vec<ClusterConfigRow>>;
}

/// Hosts plus the first error hit while reading, if any.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostInfoReport {
    pub hosts: Vec<HostInfo>,
    pub warning: Option<String>,
}

const HARDWARE_DEVICES: [&str; 2] = ["cpu", "disk"];
const LOAD_DEVICES: [&str; 2] = ["memory", "cpu"];

/// Build the inventory of every host in the cluster, sorted by hostname.
///
/// Never fails as a whole: each table that cannot be read is skipped and
/// the first such error becomes the report's warning.
pub async fn fetch_all_host_info(source: &dyn ClusterTableSource) -> HostInfoReport {
    let mut hosts = HostMap::new();
    let mut warning: Option<String> = None;
    let mut note = |table: &str, e: HostInfoError| {
        warn!(table, error = %e, "failed to read cluster table");
        warning.get_or_insert_with(|| e.to_string());
    };

    match source.device_rows(ClusterTable::Load, &LOAD_DEVICES).await {
        Ok(rows) => merge::merge_load(&mut hosts, &rows),
        Err(e) => note("load", e),
    }
    match source
        .device_rows(ClusterTable::Hardware, &HARDWARE_DEVICES)
        .await
    {
        Ok(rows) => merge::merge_hardware(&mut hosts, &rows),
        Err(e) => note("hardware", e),
    }
    match source.instance_mounts().await {
        Ok(rows) => merge::merge_instance_mounts(&mut hosts, &rows),
        Err(e) => note("config", e),
    }

    HostInfoReport {
        hosts: hosts.into_values().collect(),
        warning,
    }
}

/// Fixed rows served from memory, for local runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryClusterTables {
    hardware: Vec<ClusterTableRow>,
    load: Vec<ClusterTableRow>,
    config: Vec<ClusterConfigRow>,
    failing: Vec<ClusterTable>,
}

impl MemoryClusterTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hardware(mut self, rows: Vec<ClusterTableRow>) -> Self {
        self.hardware = rows;
        self
    }

    pub fn with_load(mut self, rows: Vec<ClusterTableRow>) -> Self {
        self.load = rows;
        self
    }

    pub fn with_config(mut self, rows: Vec<ClusterConfigRow>) -> Self {
        self.config = rows;
        self
    }

    /// Make every read of `table` fail.
    pub fn with_failing(mut self, table: ClusterTable) -> Self {
        self.failing.push(table);
        self
    }

    fn check(&self, table: ClusterTable) -> Result<()> {
        if self.failing.contains(&table) {
            return Err(HostInfoError::Query(format!(
                "{} is unavailable",
                table.table_name()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterTableSource for MemoryClusterTables {
    async fn device_rows(
        &self,
        table: ClusterTable,
        device_types: &[&str],
    ) -> Result<Vec<ClusterTableRow>> {
        self.check(table)?;
        let source = match table {
            ClusterTable::Hardware => &self.hardware,
            ClusterTable::Load => &self.load,
            ClusterTable::Config => return Ok(Vec::new()),
        };
        let mut rows: Vec<ClusterTableRow> = source
            .iter()
            .filter(|row| device_types.contains(&row.device_type.as_str()))
            .cloned()
            .collect();
        merge::sort_rows(&mut rows);
        Ok(rows)
    }

    async fn instance_mounts(&self) -> Result<Vec<ClusterConfigRow>> {
        self.check(ClusterTable::Config)?;
        Ok(self.config.clone())
    }
}

/// Build the cluster table source described by `config`.
///
/// Returns `None` when no SQL endpoint is configured.
pub async fn init_cluster_tables(
    config: &ClusterSqlConfig,
) -> Result<Option<Arc<dyn ClusterTableSource>>> {
    let Some(url) = config.url.as_deref().filter(|u| !u.trim().is_empty()) else {
        info!("Cluster SQL endpoint not configured, host endpoints disabled");
        return Ok(None);
    };

    #[cfg(feature = "mysql")]
    {
        let source = MysqlClusterTables::connect(url, config.max_connections).await?;
        info!("Cluster tables: MySQL protocol source");
        Ok(Some(Arc::new(source)))
    }

    #[cfg(not(feature = "mysql"))]
    {
        let _ = url;
        tracing::error!("Cluster SQL endpoint configured but mysql feature not enabled");
        Err(HostInfoError::Query(
            "mysql feature not enabled".to_string(),
        ))
    }
}
