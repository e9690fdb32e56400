//! Tests for the lazy HTTP client against an in-process axum server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::*;

type Hits = Arc<AtomicUsize>;

async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Json<Value> {
    let headers: BTreeMap<String, String> = headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    Json(json!({
        "method": method.to_string(),
        "path": uri.path(),
        "query": uri.query().unwrap_or_default(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    }))
}

async fn counted(State(hits): State<Hits>) -> &'static str {
    hits.fetch_add(1, Ordering::SeqCst);
    "counted"
}

async fn fail(State(hits): State<Hits>) -> (StatusCode, &'static str) {
    hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
}

async fn missing() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "no such thing")
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(5)).await;
    "late"
}

async fn stall() -> Response {
    let first = futures::stream::once(async {
        Ok::<_, std::io::Error>(Bytes::from_static(b"partial"))
    });
    let never = futures::stream::once(async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, std::io::Error>(Bytes::new())
    });
    use futures::StreamExt;
    Response::new(Body::from_stream(first.chain(never)))
}

async fn spawn_server() -> (String, Hits) {
    let hits: Hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/echo", any(echo))
        .route("/echo/*rest", any(echo))
        .route("/counted", get(counted))
        .route("/fail", get(fail))
        .route("/missing", get(missing))
        .route("/slow", get(slow))
        .route("/stall", get(stall))
        .route("/json", get(|| async { Json(json!({"name": "pd-1", "healthy": true})) }))
        .route("/text", get(|| async { "definitely not json".into_response() }))
        .with_state(Arc::clone(&hits));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), hits)
}

fn client_for(base: &str) -> Client {
    Client::new(ClientConfig::new("test").with_base_url(base)).unwrap()
}

#[tokio::test]
async fn test_request_sent_exactly_once() {
    let (base, hits) = spawn_server().await;
    let client = client_for(&base);

    let resp = client.lr().get("/counted");
    assert_eq!(hits.load(Ordering::SeqCst), 0, "nothing sent before first read");

    let head = resp.finish().await.unwrap();
    assert_eq!(head.status, StatusCode::OK);
    resp.finish().await.unwrap();
    assert_eq!(resp.read_body_as_string().await.unwrap(), "counted");

    let again = resp.read_body_as_string().await;
    assert!(matches!(again, Err(HttpError::ReadOnClosedBody)));
    assert!(resp.finish().await.is_ok());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_later_url_overrides_earlier() {
    let (base, _) = spawn_server().await;
    let client = client_for(&base);

    let body: Value = client
        .lr()
        .set_url("/missing")
        .get("/echo/b")
        .read_body_as_json()
        .await
        .unwrap();
    assert_eq!(body["path"], "/echo/b");

    let body: Value = client
        .lr()
        .set_method(Method::GET)
        .set_url("/echo/a")
        .set_url("/echo/b")
        .send()
        .read_body_as_json()
        .await
        .unwrap();
    assert_eq!(body["path"], "/echo/b");
}

#[tokio::test]
async fn test_clone_does_not_cross_contaminate() {
    let (base, _) = spawn_server().await;
    let client = client_for(&base);

    let original = client.lr().set_header("X-Tag", "one");
    let copy = original.clone().set_header("X-Tag", "two").set_query_param("copy", "1");

    let a: Value = original.get("/echo").read_body_as_json().await.unwrap();
    let b: Value = copy.get("/echo").read_body_as_json().await.unwrap();

    assert_eq!(a["headers"]["x-tag"], "one");
    assert_eq!(a["query"], "");
    assert_eq!(b["headers"]["x-tag"], "two");
    assert_eq!(b["query"], "copy=1");
}

#[tokio::test]
async fn test_non_success_status_is_request_failed() {
    let (base, hits) = spawn_server().await;
    let client = client_for(&base);

    let resp = client.lr().get("/fail");
    let err = resp.read_body_as_bytes().await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    match &err {
        HttpError::RequestFailed { kind, body, .. } => {
            assert_eq!(kind, "test");
            assert_eq!(body.as_deref(), Some("boom"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.to_string().contains("status code 500"));

    // Every later read fails the same way without resending
    assert!(resp.finish().await.is_err());
    assert_eq!(
        resp.read_body_as_string().await.unwrap_err().status(),
        Some(StatusCode::INTERNAL_SERVER_ERROR)
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let err = client.lr().get("/missing").finish().await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_transport_error_is_request_failed() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client_for(&format!("http://{}", addr));
    let err = client.lr().get("/x").finish().await.unwrap_err();
    assert!(matches!(err, HttpError::RequestFailed { status: None, .. }));
}

#[tokio::test]
async fn test_read_body_as_json() {
    let (base, _) = spawn_server().await;
    let client = client_for(&base);

    let value: Value = client.lr().get("/json").read_body_as_json().await.unwrap();
    assert_eq!(value["name"], "pd-1");

    let resp = client.lr().get("/text");
    let err = resp.read_body_as_json::<Value>().await.unwrap_err();
    assert!(err.to_string().contains("unmarshal"));
    // Later reads keep failing with the same error
    let again = resp.read_body_as_bytes().await.unwrap_err();
    assert!(again.to_string().contains("unmarshal"));
    // The response is discarded, so the head is gone too
    let finished = resp.finish().await.unwrap_err();
    assert!(finished.to_string().contains("unmarshal"));
}

#[tokio::test]
async fn test_timeout() {
    let (base, _) = spawn_server().await;
    let client = client_for(&base);

    let err = client
        .lr()
        .set_timeout(Duration::from_millis(200))
        .get("/slow")
        .finish()
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{:?}", err);
}

#[tokio::test]
async fn test_timeout_while_streaming_body() {
    let (base, _) = spawn_server().await;
    let client = client_for(&base);

    let resp = client
        .lr()
        .set_timeout(Duration::from_millis(500))
        .get("/stall");
    let head = resp.finish().await.unwrap();
    assert_eq!(head.status, StatusCode::OK);

    assert!(resp.read_body_as_bytes().await.is_err());
    // Head is still available
    assert!(resp.finish().await.is_ok());
}

#[tokio::test]
async fn test_cancellation() {
    let (base, _) = spawn_server().await;
    let client = client_for(&base);

    let token = CancellationToken::new();
    let resp = client.lr().set_cancellation(token.clone()).get("/slow");
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let err = resp.finish().await.unwrap_err();
    assert!(err.to_string().contains("canceled"));
    canceller.await.unwrap();
}

#[tokio::test]
async fn test_json_body_and_auth() {
    let (base, _) = spawn_server().await;
    let client = client_for(&base);

    let body: Value = client
        .lr()
        .set_body_json(&json!({"a": 1}))
        .set_auth_token("secret")
        .set_cookies([("session", "s1"), ("lang", "en")])
        .post("/echo")
        .read_body_as_json()
        .await
        .unwrap();

    assert_eq!(body["method"], "POST");
    assert_eq!(body["body"], r#"{"a":1}"#);
    assert_eq!(body["headers"]["content-type"], "application/json");
    assert_eq!(body["headers"]["authorization"], "Bearer secret");
    assert_eq!(body["headers"]["cookie"], "session=s1; lang=en");

    let body: Value = client
        .lr()
        .set_auth_scheme("Token")
        .set_auth_token("t")
        .get("/echo")
        .read_body_as_json()
        .await
        .unwrap();
    assert_eq!(body["headers"]["authorization"], "Token t");

    let body: Value = client
        .lr()
        .set_basic_auth("root", Some("pw".to_string()))
        .get("/echo")
        .read_body_as_json()
        .await
        .unwrap();
    // base64("root:pw")
    assert_eq!(body["headers"]["authorization"], "Basic cm9vdDpwdw==");
}

#[tokio::test]
async fn test_json_body_with_foreign_content_type_fails() {
    let (base, hits) = spawn_server().await;
    let client = client_for(&base);

    let err = client
        .lr()
        .set_header("Content-Type", "text/csv")
        .set_body_json(&json!([1, 2]))
        .post("/echo")
        .finish()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot encode"));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_query_path_params_and_form() {
    let (base, _) = spawn_server().await;
    let client = client_for(&base);

    let body: Value = client
        .lr()
        .set_path_param("id", "42")
        .set_query_params([("limit", "10"), ("state", "up")])
        .get("/echo/stores/{id}")
        .read_body_as_json()
        .await
        .unwrap();
    assert_eq!(body["path"], "/echo/stores/42");
    assert_eq!(body["query"], "limit=10&state=up");

    let body: Value = client
        .lr()
        .set_form_data([("a", "1"), ("b", "x y")])
        .post("/echo")
        .read_body_as_json()
        .await
        .unwrap();
    assert_eq!(body["body"], "a=1&b=x+y");
    assert_eq!(
        body["headers"]["content-type"],
        "application/x-www-form-urlencoded"
    );
}

#[tokio::test]
async fn test_multipart_file_reader() {
    let (base, _) = spawn_server().await;
    let client = client_for(&base);

    let body: Value = client
        .lr()
        .set_form_data([("kind", "profile")])
        .set_file_reader("file", "cpu.pb", Bytes::from_static(b"PROFILE-BYTES"))
        .post("/echo")
        .read_body_as_json()
        .await
        .unwrap();

    let content_type = body["headers"]["content-type"].as_str().unwrap();
    assert!(content_type.starts_with("multipart/form-data"));
    let text = body["body"].as_str().unwrap();
    assert!(text.contains("PROFILE-BYTES"));
    assert!(text.contains("filename=\"cpu.pb\""));
    assert!(text.contains("profile"));
}

#[tokio::test]
async fn test_pipe_body() {
    let (base, _) = spawn_server().await;
    let client = client_for(&base);

    let resp = client.lr().get("/counted");
    let mut sink: Vec<u8> = Vec::new();
    let copied = resp.pipe_body(&mut sink).await.unwrap();
    assert_eq!(copied, 7);
    assert_eq!(sink, b"counted");
    assert!(matches!(
        resp.pipe_body(&mut sink).await,
        Err(HttpError::ReadOnClosedBody)
    ));
}

#[tokio::test]
async fn test_tls_aware_base_url_without_tls() {
    let (base, _) = spawn_server().await;
    let host_port = base.trim_start_matches("http://").to_string();
    let client = Client::new(ClientConfig::new("test")).unwrap();

    let body = client
        .lr()
        .set_tls_aware_base_url(&host_port)
        .set_debug_tag("tls-aware")
        .get("/counted")
        .read_body_as_string()
        .await
        .unwrap();
    assert_eq!(body, "counted");
}

#[test]
fn test_tls_aware_base_url_rewrites_with_tls() {
    let client = Client::new(ClientConfig::new("pd").with_tls(Some(TlsConfig::default()))).unwrap();
    let req = client.lr().set_tls_aware_base_url("http://10.0.0.1:2379");
    match req.client_ops().last() {
        Some(ClientOp::BaseUrl(url)) => assert_eq!(url, "https://10.0.0.1:2379"),
        other => panic!("unexpected op: {:?}", other),
    }

    let client = client.with_tls_aware_base_url("10.0.0.2:2379");
    assert_eq!(client.base_url(), Some("https://10.0.0.2:2379"));
}

#[test]
fn test_client_clone_keeps_configuration() {
    let client = Client::new(ClientConfig::new("kv").with_base_url("127.0.0.1:20160")).unwrap();
    let clone = client.with_kind("columnar");
    assert_eq!(client.kind(), "kv");
    assert_eq!(clone.kind(), "columnar");
    assert_eq!(clone.base_url(), Some("http://127.0.0.1:20160"));
}
