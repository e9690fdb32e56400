//! Cluster-wide capacity and version statistics.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use tracing::debug;

use crate::hostinfo::HostInfo;
use crate::topology::{ComponentKind, InstanceInfo, TopologyDiscoverer, TopologyError};

/// Kinds counted by [`collect_statistics`].
pub const STATISTICS_KINDS: [ComponentKind; 8] = [
    ComponentKind::SqlEngine,
    ComponentKind::KvStore,
    ComponentKind::ColumnarStore,
    ComponentKind::Coordinator,
    ComponentKind::TsoNode,
    ComponentKind::Scheduler,
    ComponentKind::ChangeFeed,
    ComponentKind::SqlProxy,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartialStatistics {
    pub number_of_hosts: usize,
    pub number_of_instances: usize,
    pub total_memory_capacity_bytes: u64,
    pub total_physical_cores: u64,
    pub total_logical_cores: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterStatistics {
    pub probe_failure_hosts: usize,
    /// Sorted, deduplicated.
    pub versions: Vec<String>,
    pub total_stats: PartialStatistics,
    pub stats_by_instance_kind: BTreeMap<ComponentKind, PartialStatistics>,
}

#[derive(Clone, Copy)]
struct Capacity {
    memory_bytes: u64,
    physical_cores: u64,
    logical_cores: u64,
}

fn capacity(host: &HostInfo) -> Option<Capacity> {
    let memory_bytes = host.memory_usage.as_ref()?.total;
    let cpu = host.cpu_info.as_ref()?;
    let capacity = Capacity {
        memory_bytes,
        physical_cores: u64::from(cpu.physical_cores),
        logical_cores: u64::from(cpu.logical_cores),
    };
    (capacity.memory_bytes > 0 && capacity.logical_cores > 0 && capacity.physical_cores > 0)
        .then_some(capacity)
}

#[derive(Default)]
struct Accumulator<'a> {
    instances: BTreeSet<String>,
    hosts: BTreeMap<&'a str, Capacity>,
}

impl Accumulator<'_> {
    fn finish(&self) -> PartialStatistics {
        let mut stats = PartialStatistics {
            number_of_hosts: self.hosts.len(),
            number_of_instances: self.instances.len(),
            ..Default::default()
        };
        for capacity in self.hosts.values() {
            stats.total_memory_capacity_bytes += capacity.memory_bytes;
            stats.total_physical_cores += capacity.physical_cores;
            stats.total_logical_cores += capacity.logical_cores;
        }
        stats
    }
}

/// Fold instance lists and host inventory into statistics.
///
/// A host counts only when it reports positive memory and cores; hosts
/// that run instances but report no capacity are probe failures.
pub fn compute_statistics(
    instances_by_kind: &BTreeMap<ComponentKind, Vec<InstanceInfo>>,
    hosts: &[HostInfo],
) -> ClusterStatistics {
    let capacities: HashMap<&str, Capacity> = hosts
        .iter()
        .filter_map(|h| capacity(h).map(|c| (h.hostname.as_str(), c)))
        .collect();

    let mut total = Accumulator::default();
    let mut failed_hosts: BTreeSet<&str> = BTreeSet::new();
    let mut versions: BTreeSet<String> = BTreeSet::new();
    let mut stats_by_instance_kind = BTreeMap::new();

    for (kind, instances) in instances_by_kind {
        let mut per_kind = Accumulator::default();
        for instance in instances {
            let address = instance.address();
            per_kind.instances.insert(address.clone());
            total.instances.insert(address);
            if !instance.version.is_empty() {
                versions.insert(instance.version.clone());
            }
            match capacities.get_key_value(instance.ip.as_str()) {
                Some((host, capacity)) => {
                    per_kind.hosts.insert(*host, *capacity);
                    total.hosts.insert(*host, *capacity);
                }
                None => {
                    failed_hosts.insert(instance.ip.as_str());
                }
            }
        }
        stats_by_instance_kind.insert(*kind, per_kind.finish());
    }

    let probe_failure_hosts = failed_hosts
        .iter()
        .filter(|ip| !total.hosts.contains_key(*ip))
        .count();

    ClusterStatistics {
        probe_failure_hosts,
        versions: versions.into_iter().collect(),
        total_stats: total.finish(),
        stats_by_instance_kind,
    }
}

fn is_feature_absent(e: &TopologyError) -> bool {
    match e {
        TopologyError::NotFound(_) => true,
        TopologyError::RequestFailed(source)
        | TopologyError::ClientRequestFailed { source, .. } => source.is_not_found(),
        _ => false,
    }
}

/// Fetch every counted kind and compute statistics over `hosts`.
///
/// A kind whose endpoint answers 404 counts as empty.
pub async fn collect_statistics(
    discoverer: &TopologyDiscoverer,
    hosts: &[HostInfo],
) -> crate::topology::Result<ClusterStatistics> {
    let mut instances_by_kind = BTreeMap::new();
    for kind in STATISTICS_KINDS {
        let instances = match discoverer.fetch_kind(kind).await {
            Ok(instances) => instances,
            Err(e) if is_feature_absent(&e) => {
                debug!(kind = %kind, error = %e, "component not deployed, counting as empty");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        instances_by_kind.insert(kind, instances);
    }
    Ok(compute_statistics(&instances_by_kind, hosts))
}
