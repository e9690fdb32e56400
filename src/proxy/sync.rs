//! Keeps the proxy's upstream set in line with the registered SQL engines.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::FailoverProxy;
use crate::topology::{ComponentStatus, TopologyDiscoverer};

/// Handle to the upstream sync task.
pub struct UpstreamSyncHandle {
    cancel: tokio::sync::watch::Sender<bool>,
}

impl UpstreamSyncHandle {
    /// Signal the sync task to stop.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Replace the proxy's upstreams with the live SQL engines.
///
/// On a discovery error the previous set is kept. Returns the number of
/// upstreams applied.
pub async fn sync_upstreams_once(
    proxy: &FailoverProxy,
    discoverer: &TopologyDiscoverer,
) -> crate::topology::Result<usize> {
    let engines = discoverer.sql_engines().await?;
    let addrs: Vec<String> = engines
        .iter()
        .filter(|e| e.status == ComponentStatus::Up)
        .map(|e| e.address())
        .collect();
    let count = addrs.len();
    proxy.set_upstreams(addrs);
    debug!(upstreams = count, "proxy upstreams refreshed");
    Ok(count)
}

/// Spawn a task refreshing the upstream set every `interval`.
///
/// The first refresh runs immediately. The task ends once the handle is
/// stopped or dropped, and once the proxy closes.
pub fn spawn_upstream_sync(
    proxy: Arc<FailoverProxy>,
    discoverer: TopologyDiscoverer,
    interval: Duration,
) -> UpstreamSyncHandle {
    let (cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);
    let proxy_closed = proxy.cancellation();

    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            "Proxy upstream sync task started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = sync_upstreams_once(&proxy, &discoverer).await {
                        warn!(error = %e, "Proxy upstream sync failed, keeping previous upstreams");
                    }
                }
                _ = proxy_closed.cancelled() => {
                    info!("Proxy upstream sync task stopped");
                    break;
                }
                changed = cancel_rx.changed() => {
                    // A dropped handle closes the channel
                    if changed.is_err() || *cancel_rx.borrow() {
                        info!("Proxy upstream sync task stopped");
                        break;
                    }
                }
            }
        }
    });

    UpstreamSyncHandle { cancel: cancel_tx }
}
