// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

//! Integration tests for the HTTP API — uses `axum_test::TestServer`, no
//! real TCP needed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum_test::TestServer;
use tokio::sync::mpsc;

use super::*;
use crate::adapter::{AdapterCapabilities, BackendAdapter, BackendAdapterSession, ConnectOptions};
use crate::bus::EventBus;
use crate::coordinator::SessionCoordinator;
use crate::error::BrokerResult;
use crate::message::UnifiedMessage;
use crate::storage::MemoryStorage;
use crate::tracer::{Tracer, TracerConfig};

struct FakeAdapterSession {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<UnifiedMessage>>,
}

#[async_trait]
impl BackendAdapterSession for FakeAdapterSession {
    async fn recv(&self) -> Option<UnifiedMessage> {
        self.inbound.lock().await.recv().await
    }

    async fn send(&self, _msg: &UnifiedMessage) -> BrokerResult<()> {
        Ok(())
    }

    async fn close(&self) {}
}

struct FakeAdapter;

#[async_trait]
impl BackendAdapter for FakeAdapter {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    async fn connect(&self, _opts: ConnectOptions) -> BrokerResult<Arc<dyn BackendAdapterSession>> {
        let (_tx, rx) = mpsc::unbounded_channel();
        Ok(Arc::new(FakeAdapterSession { inbound: tokio::sync::Mutex::new(rx) }))
    }
}

async fn test_state(auth_token: Option<String>) -> Arc<AppState> {
    let bus = EventBus::default();
    let registry = Arc::new(crate::registry::SessionRegistry::new(Arc::new(MemoryStorage::default()), 16));
    let storage: Arc<dyn crate::storage::Storage> = Arc::new(MemoryStorage::default());
    let mut adapters: HashMap<String, Arc<dyn BackendAdapter>> = HashMap::new();
    adapters.insert("fake".into(), Arc::new(FakeAdapter));

    let tracer = Arc::new(Tracer::new(TracerConfig { enabled: false, full: false, allow_sensitive: false, prometheus_enabled: false }));
    let coordinator = SessionCoordinator::new(bus, registry, storage, adapters, "fake".into(), true, tracer);
    coordinator.start().await.unwrap();
    AppState::new(coordinator, auth_token, Arc::new(crate::adapter::InvertedRegistry::new()))
}

fn test_server(state: Arc<AppState>) -> TestServer {
    TestServer::new(build_router(state)).unwrap()
}

#[tokio::test]
async fn health_reports_session_count() {
    let state = test_state(None).await;
    state.coordinator.create_session(CreateSessionOpts { cwd: "/tmp".into(), model: None, permission_mode: None, adapter_name: None }).await.unwrap();

    let server = test_server(state);
    let resp = server.get("/health").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["sessions"], 1);
}

#[tokio::test]
async fn create_session_rejects_nonexistent_cwd() {
    let state = test_state(None).await;
    let server = test_server(state);
    let resp = server.post("/api/sessions").json(&serde_json::json!({ "cwd": "/does/not/exist" })).await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_and_fetch_and_delete_session_round_trips() {
    let state = test_state(None).await;
    let server = test_server(state);

    let create = server.post("/api/sessions").json(&serde_json::json!({ "cwd": "/tmp" })).await;
    create.assert_status(axum::http::StatusCode::CREATED);
    let info: serde_json::Value = create.json();
    let id = info["id"].as_str().unwrap().to_owned();

    let get = server.get(&format!("/api/sessions/{id}")).await;
    get.assert_status_ok();

    let delete = server.delete(&format!("/api/sessions/{id}")).await;
    delete.assert_status(axum::http::StatusCode::NO_CONTENT);

    let missing = server.get(&format!("/api/sessions/{id}")).await;
    missing.assert_status(axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rename_rejects_empty_name() {
    let state = test_state(None).await;
    let server = test_server(state);
    let create = server.post("/api/sessions").json(&serde_json::json!({ "cwd": "/tmp" })).await;
    let id = create.json::<serde_json::Value>()["id"].as_str().unwrap().to_owned();

    let resp = server.put(&format!("/api/sessions/{id}/rename")).json(&serde_json::json!({ "name": "   " })).await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn api_routes_require_bearer_token_when_configured() {
    let state = test_state(Some("s3cr3t".into())).await;
    let server = test_server(state);

    let unauthenticated = server.get("/api/sessions").await;
    unauthenticated.assert_status(axum::http::StatusCode::UNAUTHORIZED);

    let authenticated = server
        .get("/api/sessions")
        .add_header(axum::http::header::AUTHORIZATION, axum::http::HeaderValue::from_static("Bearer s3cr3t"))
        .await;
    authenticated.assert_status_ok();

    // Health stays exempt even with a token configured.
    let health = server.get("/health").await;
    health.assert_status_ok();
}

#[tokio::test]
async fn metrics_is_404_when_prometheus_disabled() {
    let state = test_state(None).await;
    let server = test_server(state);
    let resp = server.get("/metrics").await;
    resp.assert_status(axum::http::StatusCode::NOT_FOUND);
}
