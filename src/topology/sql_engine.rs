//! SQL engine topology.
//!
//! SQL engines register under `/topology/sqlEngine/`. Engines serving a
//! keyspace (multi-tenant deployments) register under
//! `/keyspaces/<tenant>/<id>/topology/sqlEngine/` instead; those are only
//! consulted when the primary prefix has no live entry.

use std::collections::BTreeSet;
use std::time::Duration;

use backon::Retryable;
use tracing::{info, warn};

use super::model::{ComponentKind, InstanceInfo};
use super::registry::{kind_prefix, now_nanos, read_prefix, scan_entries, RegistryScan};
use super::{Result, TopologyError};
use crate::coordination::CoordinationStore;
use crate::utils::netutil::{format_host_port, parse_host_port};
use crate::utils::retry::keyspace_backoff;

/// Root of keyspace-scoped registrations.
pub const KEYSPACE_ROOT: &str = "/keyspaces/";

/// Deadline for removing a stale registration.
pub const DELETE_TIMEOUT: Duration = Duration::from_secs(5);

const KEYSPACE_TOPOLOGY_SEGMENT: &str = "/topology/sqlEngine/";

/// Fetch SQL engines, falling back to keyspace registrations.
pub async fn fetch_sql_engines(store: &dyn CoordinationStore) -> Result<Vec<InstanceInfo>> {
    let prefix = kind_prefix(ComponentKind::SqlEngine);
    let entries = read_prefix(store, &prefix).await?;
    let mut scan = scan_entries(ComponentKind::SqlEngine, &prefix, &entries, now_nanos());

    if scan.alive.is_empty() {
        let keyspaces = fetch_keyspace_engines(store).await?;
        if !keyspaces.infos.is_empty() {
            info!(
                count = keyspaces.infos.len(),
                "sql engines discovered under keyspace registrations"
            );
        }
        scan.merge_first_wins(keyspaces);
    }

    Ok(scan.into_instances())
}

/// Registry prefixes of every keyspace that has SQL engine registrations.
pub fn keyspace_prefixes(keys: &[String]) -> Vec<String> {
    let mut prefixes = BTreeSet::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(KEYSPACE_ROOT) else {
            continue;
        };
        let mut parts = rest.splitn(3, '/');
        let (Some(tenant), Some(id), Some(tail)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if tenant.is_empty() || id.is_empty() {
            continue;
        }
        if format!("/{}", tail).starts_with(KEYSPACE_TOPOLOGY_SEGMENT) {
            prefixes.insert(format!(
                "{}{}/{}{}",
                KEYSPACE_ROOT, tenant, id, KEYSPACE_TOPOLOGY_SEGMENT
            ));
        }
    }
    prefixes.into_iter().collect()
}

async fn fetch_keyspace_engines(store: &dyn CoordinationStore) -> Result<RegistryScan> {
    let keys = match tokio::time::timeout(
        super::registry::FETCH_TIMEOUT,
        store.get_prefix_keys(KEYSPACE_ROOT),
    )
    .await
    {
        Ok(result) => result.map_err(TopologyError::EtcdRequestFailed)?,
        Err(_) => {
            return Err(TopologyError::Timeout {
                operation: format!("range read of {}", KEYSPACE_ROOT),
                after: super::registry::FETCH_TIMEOUT,
            })
        }
    };

    let mut merged = RegistryScan::default();
    for prefix in keyspace_prefixes(&keys) {
        let entries = (|| async { read_prefix(store, &prefix).await })
            .retry(keyspace_backoff())
            .notify(|e, delay| {
                warn!(prefix = %prefix, error = %e, ?delay, "keyspace topology read failed, retrying");
            })
            .await?;
        let scan = scan_entries(ComponentKind::SqlEngine, &prefix, &entries, now_nanos());
        merged.merge_first_wins(scan);
    }
    Ok(merged)
}

/// Remove the registration of a SQL engine.
///
/// The `info` and `ttl` keys are deleted concurrently; the first failure is
/// returned.
pub async fn delete_sql_engine(store: &dyn CoordinationStore, address: &str) -> Result<()> {
    let (host, port) = parse_host_port(address)?;
    let base = format!(
        "{}{}",
        kind_prefix(ComponentKind::SqlEngine),
        format_host_port(&host, port)
    );
    let info_key = format!("{}/info", base);
    let ttl_key = format!("{}/ttl", base);

    let deletes = futures::future::try_join(store.delete(&info_key), store.delete(&ttl_key));
    match tokio::time::timeout(DELETE_TIMEOUT, deletes).await {
        Ok(Ok((info_deleted, ttl_deleted))) => {
            info!(
                address = %address,
                deleted = info_deleted + ttl_deleted,
                "sql engine registration removed"
            );
            Ok(())
        }
        Ok(Err(e)) => Err(TopologyError::EtcdRequestFailed(e)),
        Err(_) => Err(TopologyError::Timeout {
            operation: format!("delete of {}", base),
            after: DELETE_TIMEOUT,
        }),
    }
}
