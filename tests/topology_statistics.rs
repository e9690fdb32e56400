//! Discoverer plus host inventory feeding cluster statistics, end to end.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use clusterview::coordination::MemoryCoordinationStore;
use clusterview::hostinfo::{
    fetch_all_host_info, ClusterConfigRow, ClusterTableRow, MemoryClusterTables,
};
use clusterview::httpc::{Client, ClientConfig};
use clusterview::stats::collect_statistics;
use clusterview::topology::{ComponentKind, ComponentStatus, ControllerClient, TopologyDiscoverer};

fn now_nanos() -> String {
    let now = chrono::Utc::now();
    (now.timestamp() as i128 * 1_000_000_000 + now.timestamp_subsec_nanos() as i128).to_string()
}

async fn spawn_controller() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let pd_url = base_url.clone();
    let app = Router::new()
        .route(
            "/pd/api/v1/members",
            get(move || {
                let pd_url = pd_url.clone();
                async move {
                    Json(json!({"members": [{
                        "name": "pd-1", "member_id": 1, "client_urls": [pd_url],
                        "binary_version": "v7.5.0"
                    }]}))
                }
            }),
        )
        .route(
            "/pd/api/v1/health",
            get(|| async { Json(json!([{"name": "pd-1", "member_id": 1, "health": true}])) }),
        )
        .route(
            "/pd/api/v1/status",
            get(|| async { Json(json!({"start_timestamp": 1_700_000_000})) }),
        )
        .route(
            "/pd/api/v1/stores",
            get(|| async {
                Json(json!({"count": 2, "stores": [
                    {"store": {"id": 1, "address": "127.0.0.1:20160", "status_address": "127.0.0.1:20180",
                        "version": "7.5.0", "state_name": "Up"}},
                    {"store": {"id": 2, "address": "10.9.9.9:3930", "status_address": "10.9.9.9:20292",
                        "labels": [{"key": "engine", "value": "tiflash"}],
                        "version": "v7.5.0", "state_name": "Up"}}
                ]}))
            }),
        )
        .fallback(|| async { (StatusCode::NOT_FOUND, "404 page not found").into_response() });
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    base_url
}

fn row(
    instance_type: &str,
    instance: &str,
    device_type: &str,
    name: &str,
    json: &str,
) -> ClusterTableRow {
    ClusterTableRow {
        instance_type: instance_type.to_string(),
        instance: instance.to_string(),
        device_type: device_type.to_string(),
        device_name: name.to_string(),
        json_value: json.to_string(),
    }
}

#[tokio::test]
async fn test_statistics_over_discovered_topology() {
    let store = Arc::new(MemoryCoordinationStore::new());
    store
        .put_str("/topology/sqlEngine/127.0.0.1:4000/info", r#"{"version":"v7.5.1"}"#)
        .await;
    store
        .put_str("/topology/sqlEngine/127.0.0.1:4000/ttl", &now_nanos())
        .await;

    let base_url = spawn_controller().await;
    let client = Client::new(
        ClientConfig::new("coordinator")
            .with_base_url(&base_url)
            .with_default_timeout(Duration::from_secs(5)),
    )
    .unwrap();
    let discoverer = TopologyDiscoverer::new(store, ControllerClient::new(client).unwrap());

    let coordinators = discoverer.fetch_kind(ComponentKind::Coordinator).await.unwrap();
    assert_eq!(coordinators.len(), 1);
    assert_eq!(coordinators[0].status, ComponentStatus::Up);
    assert_eq!(coordinators[0].ip, "127.0.0.1");

    let tables = MemoryClusterTables::new()
        .with_load(vec![row(
            "tikv",
            "127.0.0.1:20160",
            "memory",
            "virtual",
            r#"{"used":"10","total":"4096"}"#,
        )])
        .with_hardware(vec![
            row(
                "tikv",
                "127.0.0.1:20160",
                "cpu",
                "cpu",
                r#"{"cpu-logical-cores":"4","cpu-physical-cores":"2"}"#,
            ),
            row(
                "tikv",
                "127.0.0.1:20160",
                "disk",
                "sda",
                r#"{"path":"/","fstype":"ext4","free":"1","total":"2"}"#,
            ),
        ])
        .with_config(vec![ClusterConfigRow {
            instance_type: "tikv".to_string(),
            instance: "127.0.0.1:20160".to_string(),
            key: "storage.data-dir".to_string(),
            value: "/data/tikv".to_string(),
        }]);
    let report = fetch_all_host_info(&tables).await;
    assert!(report.warning.is_none());
    assert_eq!(report.hosts.len(), 1);

    let stats = collect_statistics(&discoverer, &report.hosts).await.unwrap();
    // sqlEngine, coordinator, kvStore on 127.0.0.1; columnarStore on 10.9.9.9
    assert_eq!(stats.total_stats.number_of_instances, 4);
    assert_eq!(stats.total_stats.number_of_hosts, 1);
    assert_eq!(stats.total_stats.total_memory_capacity_bytes, 4096);
    assert_eq!(stats.total_stats.total_logical_cores, 4);
    assert_eq!(stats.probe_failure_hosts, 1);
    assert_eq!(stats.versions, vec!["v7.5.0", "v7.5.1"]);

    // Absent microservices count as zero
    let tso = &stats.stats_by_instance_kind[&ComponentKind::TsoNode];
    assert_eq!(tso.number_of_instances, 0);
    let columnar = &stats.stats_by_instance_kind[&ComponentKind::ColumnarStore];
    assert_eq!(columnar.number_of_instances, 1);
    assert_eq!(columnar.number_of_hosts, 0);
}
