// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for the session management API (spec.md §6's table).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::coordinator::CreateSessionOpts;
use crate::error::BrokerError;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

fn broker_error_response(err: BrokerError) -> Response {
    let status = match &err {
        BrokerError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        BrokerError::SessionExists(_) => StatusCode::CONFLICT,
        BrokerError::SessionLimitReached(_) => StatusCode::TOO_MANY_REQUESTS,
        BrokerError::UnknownPermissionRequest(_) | BrokerError::InvalidFrame(_) => StatusCode::BAD_REQUEST,
        BrokerError::ConnectTimeout(_) | BrokerError::ConnectFailed(_) | BrokerError::BackendClosed => StatusCode::BAD_GATEWAY,
        BrokerError::InvalidBinaryPath(_) | BrokerError::SpawnFailed(_) | BrokerError::Storage(_) | BrokerError::Other(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, err.to_string())
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sessions: usize,
    pub uptime_ms: u64,
}

/// `GET /health`.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.coordinator.list_sessions().await.len();
    Json(HealthResponse {
        status: "ok".to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        sessions,
        uptime_ms: u64::try_from(state.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}

/// `GET /api/sessions`.
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coordinator.list_sessions().await)
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub cwd: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub adapter_name: Option<String>,
}

/// `POST /api/sessions` — validates `cwd` exists and is a directory before
/// delegating to `createSession` (spec.md §6).
pub async fn create_session(State(state): State<Arc<AppState>>, Json(req): Json<CreateSessionRequest>) -> Response {
    match tokio::fs::metadata(&req.cwd).await {
        Ok(meta) if meta.is_dir() => {}
        _ => return error_response(StatusCode::BAD_REQUEST, format!("cwd does not exist or is not a directory: {}", req.cwd)),
    }

    let opts = CreateSessionOpts { cwd: req.cwd, model: req.model, permission_mode: req.permission_mode, adapter_name: req.adapter_name };
    match state.coordinator.create_session(opts).await {
        Ok(info) => (StatusCode::CREATED, Json(info)).into_response(),
        Err(e) => broker_error_response(e),
    }
}

/// `GET /api/sessions/:id`.
pub async fn get_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.coordinator.get_session(&id).await {
        Some(info) => Json(info).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("session not found: {id}")),
    }
}

/// `DELETE /api/sessions/:id`.
pub async fn delete_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.coordinator.delete_session(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => broker_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

const MAX_SESSION_NAME_LEN: usize = 100;

/// `PUT /api/sessions/:id/rename` — trims and caps to 100 chars; 400 on an
/// empty result (spec.md §6).
pub async fn rename_session(State(state): State<Arc<AppState>>, Path(id): Path<String>, Json(req): Json<RenameRequest>) -> Response {
    let trimmed = req.name.trim();
    if trimmed.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "name must not be empty");
    }
    let name: String = trimmed.chars().take(MAX_SESSION_NAME_LEN).collect();
    match state.coordinator.rename_session(&id, name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => broker_error_response(e),
    }
}

/// `GET /metrics` — Prometheus text exposition, when the collector is
/// enabled; 404 otherwise (spec.md §6).
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.tracer().render() {
        Some(body) => ([("content-type", "text/plain; version=0.0.4")], body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
