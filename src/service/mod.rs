//! HTTP surface of the dashboard backend.
//!
//! - `GET /health`
//! - `GET /topology/:kind` (instances of one component kind)
//! - `GET /topology/store_location`
//! - `DELETE /topology/sqlEngine/:address`
//! - `GET /host/all`, `GET /host/statistics`
//! - `GET /download?token=...`


use std::sync::Arc;

use axum::extract::{FromRef, Path, State};
use axum::http::{Method, StatusCode};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ApiError;
use crate::fileswap::{download_handler, FileSwap};
use crate::hostinfo::{fetch_all_host_info, ClusterTableSource, HostInfoError, HostInfoReport};
use crate::stats::{collect_statistics, ClusterStatistics};
use crate::topology::{ComponentKind, InstanceInfo, StoreLocation, TopologyDiscoverer};

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub discoverer: TopologyDiscoverer,
    /// `None` when no cluster SQL endpoint is configured.
    pub cluster_tables: Option<Arc<dyn ClusterTableSource>>,
    pub file_swap: FileSwap,
}

impl FromRef<AppState> for FileSwap {
    fn from_ref(state: &AppState) -> Self {
        state.file_swap.clone()
    }
}

impl AppState {
    fn cluster_tables(&self) -> Result<&dyn ClusterTableSource, ApiError> {
        self.cluster_tables
            .as_deref()
            .ok_or_else(|| HostInfoError::NotConfigured.into())
    }
}

/// Start the HTTP server on `host:port`.
///
/// Port 0 binds an ephemeral port; the bound port is logged.
pub async fn serve(
    state: AppState,
    host: &str,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    let actual_port = listener.local_addr()?.port();
    info!(host, port = actual_port, "HTTP API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Build the axum router (separated for testing).
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/topology/store_location", get(store_location))
        .route("/topology/sqlEngine/:address", delete(delete_sql_engine))
        .route("/topology/:kind", get(topology_by_kind))
        .route("/host/all", get(all_hosts))
        .route("/host/statistics", get(host_statistics))
        .route("/download", get(download_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn topology_by_kind(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<Vec<InstanceInfo>>, ApiError> {
    let kind: ComponentKind = kind.parse()?;
    Ok(Json(state.discoverer.fetch_kind(kind).await?))
}

async fn store_location(State(state): State<AppState>) -> Result<Json<StoreLocation>, ApiError> {
    Ok(Json(state.discoverer.store_location().await?))
}

async fn delete_sql_engine(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.discoverer.delete_sql_engine(&address).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn all_hosts(State(state): State<AppState>) -> Result<Json<HostInfoReport>, ApiError> {
    let source = state.cluster_tables()?;
    Ok(Json(fetch_all_host_info(source).await))
}

/// Statistics plus the host inventory warning, if any.
#[derive(Debug, Serialize)]
pub struct StatisticsReport {
    #[serde(flatten)]
    pub statistics: ClusterStatistics,
    pub warning: Option<String>,
}

async fn host_statistics(
    State(state): State<AppState>,
) -> Result<Json<StatisticsReport>, ApiError> {
    let source = state.cluster_tables()?;
    let report = fetch_all_host_info(source).await;
    let statistics = collect_statistics(&state.discoverer, &report.hosts).await?;
    Ok(Json(StatisticsReport {
        statistics,
        warning: report.warning,
    }))
}
