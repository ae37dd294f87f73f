// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket facade (spec.md §6) — the daemon's only network-facing
//! layer. Everything here is a thin translation to and from the
//! [`crate::coordinator::SessionCoordinator`] API; no broker state lives in
//! this module.

pub mod auth;
pub mod http;
pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, put};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::adapter::InvertedRegistry;
use crate::coordinator::SessionCoordinator;

/// Shared state handed to every handler, mirroring the teacher's
/// single `Arc<MuxState>` extractor state (spec.md §6).
pub struct AppState {
    pub coordinator: Arc<SessionCoordinator>,
    pub auth_token: Option<String>,
    pub inverted: Arc<InvertedRegistry>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(coordinator: Arc<SessionCoordinator>, auth_token: Option<String>, inverted: Arc<InvertedRegistry>) -> Arc<Self> {
        Arc::new(Self { coordinator, auth_token, inverted, started_at: Instant::now() })
    }
}

/// Body larger than this is rejected with 413 before a handler ever sees it
/// (spec.md §6: "413 if body > 1 MiB").
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the axum `Router` with every route named in spec.md §6.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(http::health))
        .route("/api/sessions", get(http::list_sessions).post(http::create_session))
        .route("/api/sessions/{id}", get(http::get_session).delete(http::delete_session))
        .route("/api/sessions/{id}/rename", put(http::rename_session))
        .route("/metrics", get(http::metrics))
        .route("/ws/consumer/{session_id}", get(ws::consumer_ws_handler))
        .route("/ws/cli/{session_id}", get(ws::cli_ws_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
