//! Folding cluster table rows into per-host records.
//!
//! Rows must arrive in [`device_rows_query`](super::query::device_rows_query)
//! order; every "first row wins" rule below depends on it.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::warn;

use super::query::{sort_rank, MOUNT_CONFIG_KEYS};
use super::{
    ClusterConfigRow, ClusterTableRow, CpuInfo, CpuUsage, HostInfo, HostInstance, MemoryUsage,
    PartitionInfo,
};
use crate::topology::ComponentKind;
use crate::utils::netutil::parse_host_port;

pub type HostMap = BTreeMap<String, HostInfo>;

/// Stable sort into query order, for sources that cannot order rows.
pub fn sort_rows(rows: &mut [ClusterTableRow]) {
    rows.sort_by(|a, b| {
        sort_rank(&b.instance_type)
            .cmp(&sort_rank(&a.instance_type))
            .then_with(|| a.instance.cmp(&b.instance))
            .then_with(|| a.device_type.cmp(&b.device_type))
            .then_with(|| a.device_name.cmp(&b.device_name))
    });
}

fn host_entry<'a>(hosts: &'a mut HostMap, instance: &str) -> Option<&'a mut HostInfo> {
    match parse_host_port(instance) {
        Ok((host, _)) => Some(
            hosts
                .entry(host.clone())
                .or_insert_with(|| HostInfo::new(host)),
        ),
        Err(e) => {
            warn!(instance, error = %e, "ignoring cluster table row with invalid instance");
            None
        }
    }
}

fn parse_object(row: &ClusterTableRow) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(&row.json_value) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) | Err(_) => {
            warn!(
                instance = %row.instance,
                device_type = %row.device_type,
                value = %row.json_value,
                "ignoring cluster table row with malformed json"
            );
            None
        }
    }
}

/// Numeric field reported either as a JSON number or a numeric string.
fn number(map: &Map<String, Value>, name: &str) -> Option<f64> {
    match map.get(name)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn unsigned(map: &Map<String, Value>, name: &str) -> Option<u64> {
    match map.get(name)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Saturates at `u32::MAX`.
fn core_count(map: &Map<String, Value>, name: &str) -> u32 {
    unsigned(map, name).map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

fn text(map: &Map<String, Value>, name: &str) -> String {
    match map.get(name) {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

/// Merge `CLUSTER_HARDWARE` rows (cpu and disk).
pub fn merge_hardware(hosts: &mut HostMap, rows: &[ClusterTableRow]) {
    for row in rows {
        let device_type = row.device_type.to_ascii_lowercase();
        if device_type != "cpu" && device_type != "disk" {
            continue;
        }
        if device_type == "cpu" && !row.device_name.eq_ignore_ascii_case("cpu") {
            continue;
        }
        let Some(map) = parse_object(row) else {
            continue;
        };
        let Some(host) = host_entry(hosts, &row.instance) else {
            continue;
        };

        if device_type == "cpu" {
            if host.cpu_info.is_none() {
                host.cpu_info = Some(CpuInfo {
                    arch: text(&map, "cpu-arch"),
                    logical_cores: core_count(&map, "cpu-logical-cores"),
                    physical_cores: core_count(&map, "cpu-physical-cores"),
                });
            }
            continue;
        }

        let Some(kind) = ComponentKind::from_sql_type_name(&row.instance_type) else {
            continue;
        };
        match host.partition_provider_kind {
            None => host.partition_provider_kind = Some(kind),
            Some(provider) if provider != kind => continue,
            Some(_) => {}
        }
        let path = text(&map, "path");
        if path.is_empty() {
            continue;
        }
        host.partitions
            .entry(path.to_lowercase())
            .or_insert_with(|| PartitionInfo {
                path: path.clone(),
                fs_type: text(&map, "fstype"),
                free: unsigned(&map, "free").unwrap_or(0),
                total: unsigned(&map, "total").unwrap_or(0),
            });
    }
}

/// Merge `CLUSTER_LOAD` rows (virtual memory and cpu usage).
pub fn merge_load(hosts: &mut HostMap, rows: &[ClusterTableRow]) {
    for row in rows {
        let device_type = row.device_type.to_ascii_lowercase();
        let device_name = row.device_name.to_ascii_lowercase();
        let is_memory = device_type == "memory" && device_name == "virtual";
        let is_cpu = device_type == "cpu" && device_name == "usage";
        if !is_memory && !is_cpu {
            continue;
        }
        let Some(map) = parse_object(row) else {
            continue;
        };
        let Some(host) = host_entry(hosts, &row.instance) else {
            continue;
        };

        if is_memory {
            if host.memory_usage.is_none() {
                host.memory_usage = Some(MemoryUsage {
                    used: unsigned(&map, "used").unwrap_or(0),
                    total: unsigned(&map, "total").unwrap_or(0),
                });
            }
        } else if host.cpu_usage.is_none() {
            host.cpu_usage = Some(CpuUsage {
                idle: number(&map, "idle").unwrap_or(0.0),
                system: number(&map, "system").unwrap_or(0.0),
            });
        }
    }
}

/// Attach instances to the partition holding their data directory.
///
/// Only the [`MOUNT_CONFIG_KEYS`] entry for the instance's kind counts.
pub fn merge_instance_mounts(hosts: &mut HostMap, rows: &[ClusterConfigRow]) {
    for row in rows {
        let Some(kind) = ComponentKind::from_sql_type_name(&row.instance_type) else {
            continue;
        };
        if !is_mount_key(kind, &row.key) {
            continue;
        }
        let Some(host) = host_entry(hosts, &row.instance) else {
            continue;
        };
        let matched = longest_partition_match(&host.partitions, &row.value);
        host.instances
            .entry(row.instance.clone())
            .or_insert(HostInstance {
                kind,
                matched_partition_path_lower: matched,
            });
    }
}

fn is_mount_key(kind: ComponentKind, key: &str) -> bool {
    MOUNT_CONFIG_KEYS
        .iter()
        .any(|(mount_kind, mount_key)| *mount_kind == kind && *mount_key == key)
}

/// Longest partition path that prefixes `path`, compared case-insensitively.
///
/// Returns the lower-cased partition key, or an empty string.
pub fn longest_partition_match(partitions: &BTreeMap<String, PartitionInfo>, path: &str) -> String {
    let path = path.to_lowercase();
    partitions
        .keys()
        .filter(|partition| path.starts_with(partition.as_str()))
        .max_by_key(|partition| partition.len())
        .cloned()
        .unwrap_or_default()
}
