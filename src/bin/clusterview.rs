//! clusterview: cluster topology and host inventory service
//!
//! Serves component topology, host inventory, cluster statistics and
//! one-shot downloads over HTTP. Optionally runs a local failover TCP proxy
//! in front of the live SQL engines.
//!
//! ## Architecture
//! ```text
//! [coordination store] --+
//! [cluster controller] --+--> [TopologyDiscoverer] --> [HTTP API :12333]
//! [cluster SQL tables] --+                        \
//!                                                  --> [FailoverProxy 127.0.0.1:<ephemeral>]
//! ```
//!
//! ## Configuration
//! - `--config <path>` or `CLUSTERVIEW_CONFIG`: YAML config file
//! - `CLUSTERVIEW__<SECTION>__<KEY>`: per-field overrides
//! - `CLUSTERVIEW_LOG`: tracing filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use clusterview::config::Config;
use clusterview::coordination::init_coordination;
use clusterview::fileswap::FileSwap;
use clusterview::hostinfo::init_cluster_tables;
use clusterview::proxy::{spawn_upstream_sync, FailoverProxy, ProxyConfig};
use clusterview::service::{self, AppState};
use clusterview::topology::{ControllerClient, TopologyDiscoverer};
use clusterview::utils::bootstrap::{init_tracing, parse_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e.to_string()
    })?;

    info!(
        host = %config.server.host,
        port = config.server.port,
        controller = %config.controller.endpoint,
        "starting clusterview"
    );

    let store = init_coordination(&config.coordination).await?;
    let controller = ControllerClient::from_config(&config.controller, &config.http)?;
    let discoverer = TopologyDiscoverer::new(store, controller);
    let cluster_tables = init_cluster_tables(&config.cluster_sql).await?;
    let file_swap = FileSwap::from_settings(&config.file_swap);

    let proxy = if config.proxy.enabled {
        let proxy = Arc::new(
            FailoverProxy::new(Vec::<String>::new(), ProxyConfig::from_settings(&config.proxy))
                .await?,
        );
        let sync = spawn_upstream_sync(
            Arc::clone(&proxy),
            discoverer.clone(),
            Duration::from_secs(config.proxy.upstream_sync_interval_secs.max(1)),
        );
        info!(port = proxy.port(), "SQL failover proxy started");
        Some((proxy, sync))
    } else {
        None
    };

    let state = AppState {
        discoverer,
        cluster_tables,
        file_swap,
    };
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
    };
    service::serve(state, &config.server.host, config.server.port, shutdown).await?;

    if let Some((proxy, sync)) = proxy {
        sync.stop();
        proxy.close();
    }
    info!("clusterview stopped");
    Ok(())
}
