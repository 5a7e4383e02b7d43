mod common;

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::MockServer;

use solcast_forecast::api;
use solcast_forecast::engine::AppState;
use solcast_forecast::solcast::SolcastClient;

use common::*;

struct TestApp {
    addr: SocketAddr,
    client: reqwest::Client,
    _dir: TempDir,
    _server: MockServer,
}

impl TestApp {
    fn url(&self, path: &str) -> String {
        format!("http://{}/api/v1{path}", self.addr)
    }
}

async fn spawn_app() -> TestApp {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    mount_sites(&server, "k1", &["s1"]).await;
    mount_usage(&server, "k1", 10, 0).await;
    mount_site_data(&server, "s1", 1, 1).await;

    let cfg = config(&server, dir.path(), "k1");
    let client = SolcastClient::new(&cfg.solcast).unwrap();
    let state = AppState::new(cfg, Arc::new(client)).unwrap();
    state.engine.start().await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        addr,
        client: reqwest::Client::new(),
        _dir: dir,
        _server: server,
    }
}

#[tokio::test]
async fn test_healthz() {
    let app = spawn_app().await;
    let resp = app.client.get(app.url("/healthz")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_sensors_and_status() {
    let app = spawn_app().await;

    let body: Value = app.client.get(app.url("/sensors")).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["api_limit"], 10);
    assert_eq!(body["data"]["dampening_mode"], "uniform");

    let body: Value = app.client.get(app.url("/status")).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["data"]["status"]["status"], "ready");
    assert_eq!(body["data"]["records"], 6);
}

#[tokio::test]
async fn test_query_returns_records() {
    let app = spawn_app().await;
    let start = current_slot() - chrono::Duration::hours(3);
    let end = current_slot() + chrono::Duration::hours(3);

    let resp = app
        .client
        .get(app.url("/forecast/query"))
        .query(&[
            ("start", start.to_rfc3339()),
            ("end", end.to_rfc3339()),
            ("site", "s1".to_string()),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"].as_array().unwrap().len(), 6);

    let resp = app
        .client
        .get(app.url("/forecast/query"))
        .query(&[("start", end.to_rfc3339()), ("end", start.to_rfc3339())])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_dampening_validation() {
    let app = spawn_app().await;

    let resp = app
        .client
        .put(app.url("/dampening"))
        .json(&json!({ "factors": "1,1,1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let factors = vec!["0.5"; 24].join(",");
    let resp = app
        .client
        .put(app.url("/dampening"))
        .json(&json!({ "factors": factors, "site": "nope" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = app
        .client
        .put(app.url("/dampening"))
        .json(&json!({ "factors": factors }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_hard_limit_roundtrip() {
    let app = spawn_app().await;

    let body: Value = app
        .client
        .put(app.url("/hard_limit"))
        .json(&json!({ "hard_limit": "3" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"], "3.0");

    let resp = app
        .client
        .put(app.url("/hard_limit"))
        .json(&json!({ "hard_limit": "abc" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_day_offset_out_of_range() {
    let app = spawn_app().await;
    let resp = app.client.get(app.url("/forecast/day/8")).send().await.unwrap();
    assert_eq!(resp.status(), 400);
    let resp = app.client.get(app.url("/forecast/day/0")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}
