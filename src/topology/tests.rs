//! Topology discovery against an in-memory coordination store and a mock
//! controller served by axum.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use super::registry::now_nanos;
use super::*;
use crate::coordination::MemoryCoordinationStore;
use crate::httpc::{Client, ClientConfig};

#[derive(Clone)]
struct MockController {
    base_url: String,
    closed_url: String,
    microservices: bool,
    stores_fail: bool,
}

async fn members(State(mock): State<MockController>) -> Json<Value> {
    Json(json!({
        "members": [
            {
                "name": "pd-1",
                "member_id": 1,
                "client_urls": [mock.base_url],
                "binary_version": "7.5.0",
                "git_hash": "g1",
                "deploy_path": "/deploy/pd-1"
            },
            {
                "name": "pd-2",
                "member_id": 2,
                "client_urls": [mock.closed_url],
                "binary_version": "v7.5.0",
                "git_hash": "g2",
                "deploy_path": "/deploy/pd-2"
            },
            {
                "name": "pd-3",
                "member_id": 3,
                "client_urls": ["not a url"],
            }
        ]
    }))
}

async fn health() -> Json<Value> {
    Json(json!([
        {"name": "pd-1", "member_id": 1, "health": true},
        {"name": "pd-2", "member_id": 2, "health": true},
        {"name": "pd-3", "member_id": 3, "health": false}
    ]))
}

async fn status() -> Json<Value> {
    Json(json!({"version": "v7.5.0", "start_timestamp": 1_700_000_000}))
}

async fn stores(State(mock): State<MockController>) -> Response {
    if mock.stores_fail {
        return (StatusCode::INTERNAL_SERVER_ERROR, "stores unavailable").into_response();
    }
    Json(json!({
        "count": 3,
        "stores": [
            {"store": {
                "id": 4, "address": "10.0.1.2:20160", "status_address": "10.0.1.2:20180",
                "labels": [{"key": "zone", "value": "z2"}],
                "version": "7.5.0", "git_hash": "kv", "deploy_path": "/kv",
                "start_timestamp": 1_700_000_001, "state_name": "Up"
            }},
            {"store": {
                "id": 1, "address": "10.0.1.1:20160", "status_address": "10.0.1.1:20180",
                "labels": [{"key": "zone", "value": "z1"}],
                "version": "v7.5.0", "state_name": "Down"
            }},
            {"store": {
                "id": 9, "address": "10.0.1.3:3930", "status_address": "10.0.1.3:20292",
                "labels": [{"key": "engine", "value": "tiflash"}, {"key": "zone", "value": "z1"}],
                "version": "v7.5.0", "state_name": "Up"
            }}
        ]
    }))
    .into_response()
}

async fn replicate() -> Json<Value> {
    Json(json!({"max-replicas": 3, "location-labels": "zone,host"}))
}

async fn tso(State(mock): State<MockController>) -> Response {
    if !mock.microservices {
        return (StatusCode::NOT_FOUND, "404 page not found").into_response();
    }
    Json(json!([
        {
            "service-addr": "http://10.0.2.2:3379",
            "version": "7.5.0",
            "git-hash": "t2",
            "deploy-path": "/tso",
            "start-timestamp": 1_700_000_002
        },
        {
            "service-addr": "http://10.0.2.1:3379",
            "version": "v7.5.0",
            "git-hash": "t1",
            "deploy-path": "/tso",
            "start-timestamp": 1_700_000_002
        }
    ]))
    .into_response()
}

async fn scheduling(State(mock): State<MockController>) -> Response {
    if !mock.microservices {
        return (StatusCode::NOT_FOUND, "404 page not found").into_response();
    }
    Json(json!([{"service-addr": "http://10.0.3.1:3379", "version": "v7.5.0"}])).into_response()
}

async fn spawn_controller(microservices: bool, stores_fail: bool) -> String {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let closed_url = format!("http://{}", closed.local_addr().unwrap());
    drop(closed);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let mock = MockController {
        base_url: base_url.clone(),
        closed_url,
        microservices,
        stores_fail,
    };
    let app = Router::new()
        .route("/pd/api/v1/members", get(members))
        .route("/pd/api/v1/health", get(health))
        .route("/pd/api/v1/status", get(status))
        .route("/pd/api/v1/stores", get(stores))
        .route("/pd/api/v1/config/replicate", get(replicate))
        .route("/pd/api/v2/ms/members/tso", get(tso))
        .route("/pd/api/v2/ms/members/scheduling", get(scheduling))
        .with_state(mock);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    base_url
}

fn controller_for(base_url: &str) -> ControllerClient {
    let client = Client::new(
        ClientConfig::new("coordinator")
            .with_base_url(base_url)
            .with_default_timeout(Duration::from_secs(5)),
    )
    .unwrap();
    ControllerClient::new(client).unwrap()
}

fn offline_controller() -> ControllerClient {
    controller_for("http://127.0.0.1:9")
}

async fn discoverer_with_store() -> (TopologyDiscoverer, Arc<MemoryCoordinationStore>) {
    let store = Arc::new(MemoryCoordinationStore::new());
    let discoverer = TopologyDiscoverer::new(store.clone(), offline_controller());
    (discoverer, store)
}

const ENGINE_INFO: &str = r#"{"version":"v7.0.0","git_hash":"abc","deploy_path":"/x","status_port":10080,"start_timestamp":1700000000}"#;

// ============================================================================
// Coordination-store fetchers
// ============================================================================

#[tokio::test]
async fn test_sql_engine_with_fresh_ttl_is_up() {
    let (discoverer, store) = discoverer_with_store().await;
    store
        .put_str("/topology/sqlEngine/10.0.0.1:4000/info", ENGINE_INFO)
        .await;
    store
        .put_str("/topology/sqlEngine/10.0.0.1:4000/ttl", &now_nanos().to_string())
        .await;

    let engines = discoverer.sql_engines().await.unwrap();
    assert_eq!(engines.len(), 1);
    let engine = &engines[0];
    assert_eq!(engine.kind, ComponentKind::SqlEngine);
    assert_eq!(engine.address(), "10.0.0.1:4000");
    assert_eq!(engine.status, ComponentStatus::Up);
    assert_eq!(engine.version, "v7.0.0");
    assert_eq!(engine.git_hash, "abc");
    assert_eq!(engine.deploy_path, "/x");
    assert_eq!(engine.status_port, 10080);
    assert_eq!(engine.start_timestamp, 1_700_000_000);
}

#[tokio::test]
async fn test_sql_engine_without_ttl_is_unreachable() {
    let (discoverer, store) = discoverer_with_store().await;
    store
        .put_str("/topology/sqlEngine/10.0.0.1:4000/info", ENGINE_INFO)
        .await;

    let engines = discoverer.sql_engines().await.unwrap();
    assert_eq!(engines.len(), 1);
    assert_eq!(engines[0].status, ComponentStatus::Unreachable);
}

#[tokio::test]
async fn test_sql_engine_with_stale_ttl_stays_up() {
    let (discoverer, store) = discoverer_with_store().await;
    let stale = now_nanos() - 60 * 1_000_000_000;
    store
        .put_str("/topology/sqlEngine/10.0.0.1:4000/info", ENGINE_INFO)
        .await;
    store
        .put_str("/topology/sqlEngine/10.0.0.1:4000/ttl", &stale.to_string())
        .await;

    let engines = discoverer.sql_engines().await.unwrap();
    assert_eq!(engines[0].status, ComponentStatus::Up);
}

#[tokio::test]
async fn test_sql_engines_sorted_by_ip_then_port() {
    let (discoverer, store) = discoverer_with_store().await;
    for addr in ["10.0.0.2:4000", "10.0.0.1:4001", "10.0.0.1:4000"] {
        store
            .put_str(&format!("/topology/sqlEngine/{}/info", addr), ENGINE_INFO)
            .await;
        store
            .put_str(
                &format!("/topology/sqlEngine/{}/ttl", addr),
                &now_nanos().to_string(),
            )
            .await;
    }
    let engines = discoverer.sql_engines().await.unwrap();
    let addrs: Vec<String> = engines.iter().map(InstanceInfo::address).collect();
    assert_eq!(addrs, ["10.0.0.1:4000", "10.0.0.1:4001", "10.0.0.2:4000"]);
}

#[tokio::test]
async fn test_sql_engine_keyspace_fallback_first_wins() {
    let (discoverer, store) = discoverer_with_store().await;
    let now = now_nanos().to_string();
    store
        .put_str(
            "/keyspaces/tenant-a/1/topology/sqlEngine/10.0.0.5:4000/info",
            r#"{"version":"v7.1.0","git_hash":"first"}"#,
        )
        .await;
    store
        .put_str("/keyspaces/tenant-a/1/topology/sqlEngine/10.0.0.5:4000/ttl", &now)
        .await;
    store
        .put_str(
            "/keyspaces/tenant-a/2/topology/sqlEngine/10.0.0.5:4000/info",
            r#"{"version":"v7.1.0","git_hash":"second"}"#,
        )
        .await;
    store
        .put_str(
            "/keyspaces/tenant-b/1/topology/sqlEngine/10.0.0.6:4000/info",
            r#"{"version":"7.1.0"}"#,
        )
        .await;

    let engines = discoverer.sql_engines().await.unwrap();
    assert_eq!(engines.len(), 2);
    assert_eq!(engines[0].address(), "10.0.0.5:4000");
    assert_eq!(engines[0].git_hash, "first");
    assert_eq!(engines[0].status, ComponentStatus::Up);
    assert_eq!(engines[1].status, ComponentStatus::Unreachable);
    assert_eq!(engines[1].version, "v7.1.0");
}

#[tokio::test]
async fn test_keyspace_fallback_skipped_when_primary_alive() {
    let (discoverer, store) = discoverer_with_store().await;
    store
        .put_str("/topology/sqlEngine/10.0.0.1:4000/info", ENGINE_INFO)
        .await;
    store
        .put_str("/topology/sqlEngine/10.0.0.1:4000/ttl", &now_nanos().to_string())
        .await;
    store
        .put_str(
            "/keyspaces/t/1/topology/sqlEngine/10.0.0.9:4000/info",
            ENGINE_INFO,
        )
        .await;

    let engines = discoverer.sql_engines().await.unwrap();
    assert_eq!(engines.len(), 1);
    assert_eq!(engines[0].address(), "10.0.0.1:4000");
}

#[tokio::test]
async fn test_range_read_failure_propagates() {
    let (discoverer, store) = discoverer_with_store().await;
    store.set_fail_on_get(true).await;

    let err = discoverer.sql_engines().await.unwrap_err();
    assert!(matches!(err, TopologyError::EtcdRequestFailed(_)));
    let err = discoverer.sql_proxies().await.unwrap_err();
    assert!(matches!(err, TopologyError::EtcdRequestFailed(_)));
}

#[tokio::test]
async fn test_range_read_deadline() {
    let (discoverer, store) = discoverer_with_store().await;
    store.set_delay(Some(Duration::from_secs(3))).await;

    let err = discoverer.change_feeds().await.unwrap_err();
    assert!(matches!(err, TopologyError::Timeout { .. }), "{:?}", err);
}

#[tokio::test]
async fn test_sql_proxy_and_change_feed() {
    let (discoverer, store) = discoverer_with_store().await;
    store
        .put_str(
            "/topology/sqlProxy/10.0.0.7:6000/info",
            r#"{"version":"1.0.0","status_port":3080}"#,
        )
        .await;
    store
        .put_str("/topology/sqlProxy/10.0.0.7:6000/ttl", &now_nanos().to_string())
        .await;
    store
        .put_str("/topology/changeFeed/10.0.0.8:8300/info", r#"{"version":"v7.5.0"}"#)
        .await;

    let proxies = discoverer.fetch_kind(ComponentKind::SqlProxy).await.unwrap();
    assert_eq!(proxies.len(), 1);
    assert_eq!(proxies[0].status, ComponentStatus::Up);
    assert_eq!(proxies[0].status_port, 3080);
    assert_eq!(proxies[0].version, "v1.0.0");

    let feeds = discoverer.fetch_kind(ComponentKind::ChangeFeed).await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].kind, ComponentKind::ChangeFeed);
    assert_eq!(feeds[0].status, ComponentStatus::Unreachable);
}

#[tokio::test]
async fn test_singletons() {
    let (discoverer, store) = discoverer_with_store().await;
    store
        .put_str(
            "/topology/metrics",
            r#"{"ip":"10.0.0.9","port":9090,"binary_path":"/prom"}"#,
        )
        .await;
    store.put_str("/topology/dashboard", "not json").await;

    let metrics = discoverer.singleton(ComponentKind::Metrics).await.unwrap();
    assert_eq!(
        metrics,
        Some(SingletonInfo {
            ip: "10.0.0.9".to_string(),
            port: 9090
        })
    );
    assert_eq!(discoverer.singleton(ComponentKind::Dashboard).await.unwrap(), None);
    assert_eq!(discoverer.singleton(ComponentKind::Alerting).await.unwrap(), None);
    assert!(discoverer.singleton(ComponentKind::KvStore).await.is_err());

    let listed = discoverer.fetch_kind(ComponentKind::Metrics).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].address(), "10.0.0.9:9090");
    assert!(discoverer
        .fetch_kind(ComponentKind::Alerting)
        .await
        .unwrap()
        .is_empty());
}

// ============================================================================
// sqlEngine deletion
// ============================================================================

#[tokio::test]
async fn test_delete_sql_engine() {
    let (discoverer, store) = discoverer_with_store().await;
    store
        .put_str("/topology/sqlEngine/10.0.0.1:4000/info", ENGINE_INFO)
        .await;
    store.put_str("/topology/sqlEngine/10.0.0.1:4000/ttl", "1").await;
    store
        .put_str("/topology/sqlEngine/10.0.0.2:4000/info", ENGINE_INFO)
        .await;

    discoverer.delete_sql_engine("10.0.0.1:4000").await.unwrap();

    let keys = store.get_prefix_keys("/topology/").await.unwrap();
    assert_eq!(keys, ["/topology/sqlEngine/10.0.0.2:4000/info"]);
}

#[tokio::test]
async fn test_delete_sql_engine_errors() {
    let (discoverer, store) = discoverer_with_store().await;

    let err = discoverer.delete_sql_engine("10.0.0.1").await.unwrap_err();
    assert!(matches!(err, TopologyError::InvalidAddress(_)));

    store.set_fail_on_delete(true).await;
    let err = discoverer.delete_sql_engine("10.0.0.1:4000").await.unwrap_err();
    assert!(matches!(err, TopologyError::EtcdRequestFailed(_)));
}

// ============================================================================
// Controller API
// ============================================================================

#[tokio::test]
async fn test_coordinators() {
    let base = spawn_controller(true, false).await;
    let controller = controller_for(&base);
    let base_port: u16 = base.rsplit(':').next().unwrap().parse().unwrap();

    let coordinators = controller.fetch_coordinators().await.unwrap();
    assert_eq!(coordinators.len(), 2, "member with invalid url is skipped");

    let reachable = coordinators.iter().find(|c| c.port == base_port).unwrap();
    assert_eq!(reachable.status, ComponentStatus::Up);
    assert_eq!(reachable.version, "v7.5.0");
    assert_eq!(reachable.start_timestamp, 1_700_000_000);
    assert_eq!(reachable.deploy_path, "/deploy/pd-1");

    let unreachable = coordinators.iter().find(|c| c.port != base_port).unwrap();
    assert_eq!(unreachable.status, ComponentStatus::Up, "healthy per health api");
    assert_eq!(unreachable.start_timestamp, 0, "status fetch failed");
}

#[tokio::test]
async fn test_stores_split_by_engine() {
    let base = spawn_controller(true, false).await;
    let discoverer = TopologyDiscoverer::new(
        Arc::new(MemoryCoordinationStore::new()),
        controller_for(&base),
    );

    let kv = discoverer.fetch_kind(ComponentKind::KvStore).await.unwrap();
    let addrs: Vec<String> = kv.iter().map(InstanceInfo::address).collect();
    assert_eq!(addrs, ["10.0.1.1:20160", "10.0.1.2:20160"]);
    assert_eq!(kv[0].status, ComponentStatus::Down);
    assert_eq!(kv[1].status, ComponentStatus::Up);
    assert_eq!(kv[1].version, "v7.5.0");
    assert_eq!(kv[1].status_port, 20180);

    let columnar = discoverer
        .fetch_kind(ComponentKind::ColumnarStore)
        .await
        .unwrap();
    assert_eq!(columnar.len(), 1);
    assert_eq!(columnar[0].address(), "10.0.1.3:3930");
}

#[tokio::test]
async fn test_store_failure_is_client_request_failed() {
    let base = spawn_controller(true, true).await;
    let controller = controller_for(&base);

    let err = controller.fetch_stores().await.unwrap_err();
    match err {
        TopologyError::ClientRequestFailed { kind, source } => {
            assert_eq!(kind, ComponentKind::KvStore);
            assert_eq!(source.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_microservices_present() {
    let base = spawn_controller(true, false).await;
    let controller = controller_for(&base);

    let tso = controller
        .fetch_microservice(ComponentKind::TsoNode)
        .await
        .unwrap();
    let addrs: Vec<String> = tso.iter().map(InstanceInfo::address).collect();
    assert_eq!(addrs, ["10.0.2.1:3379", "10.0.2.2:3379"]);
    assert!(tso.iter().all(|t| t.version == "v7.5.0"));

    let scheduling = controller
        .fetch_microservice(ComponentKind::Scheduler)
        .await
        .unwrap();
    assert_eq!(scheduling.len(), 1);
    assert_eq!(scheduling[0].kind, ComponentKind::Scheduler);
}

#[tokio::test]
async fn test_microservices_absent_are_empty() {
    let base = spawn_controller(false, false).await;
    let discoverer = TopologyDiscoverer::new(
        Arc::new(MemoryCoordinationStore::new()),
        controller_for(&base),
    );

    assert!(discoverer.tso_nodes().await.unwrap().is_empty());
    assert!(discoverer.schedulers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_store_location() {
    let base = spawn_controller(false, false).await;
    let controller = controller_for(&base);

    let location = controller.fetch_store_location().await.unwrap();
    assert_eq!(location.location_labels, ["zone", "host"]);
    assert_eq!(location.stores.len(), 3);
    assert_eq!(location.stores[0].address, "10.0.1.1:20160");
    assert_eq!(location.stores[0].labels.get("zone").unwrap(), "z1");
    assert_eq!(location.stores[2].labels.get("engine").unwrap(), "tiflash");
}

#[tokio::test]
async fn test_controller_unreachable_propagates() {
    let controller = offline_controller();
    let err = controller.fetch_coordinators().await.unwrap_err();
    assert!(matches!(err, TopologyError::RequestFailed(_)));
}
