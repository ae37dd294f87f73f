// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer-token auth for the HTTP facade (spec.md §6: "an optional static
//! bearer token is the only auth primitive"). Mirrors the teacher's
//! `transport/auth.rs`: constant-time comparison, a query-param variant for
//! WebSocket upgrades (no `Authorization` header available there), and an
//! axum middleware gating everything under `/api/*`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, axum::Json(ErrorBody { error: "unauthorized".to_owned() })).into_response()
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validate a `Authorization: Bearer <token>` header. `Ok(())` when no
/// token is configured — auth is disabled (spec.md §6).
pub fn validate_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), ()> {
    let Some(expected) = expected else { return Ok(()) };
    let header = headers.get("authorization").and_then(|v| v.to_str().ok()).ok_or(())?;
    let token = header.strip_prefix("Bearer ").ok_or(())?;
    if constant_time_eq(token, expected) {
        Ok(())
    } else {
        Err(())
    }
}

/// Validate the `token` query parameter carried by a WebSocket upgrade
/// (spec.md §6: "Query param `token` ... required when the tunnel is
/// enabled").
pub fn validate_ws_query(token: Option<&str>, expected: Option<&str>) -> Result<(), ()> {
    let Some(expected) = expected else { return Ok(()) };
    match token {
        Some(t) if constant_time_eq(t, expected) => Ok(()),
        _ => Err(()),
    }
}

/// Gate `/api/*`; `/health`, `/metrics`, and every `/ws/*` upgrade are
/// exempt (spec.md §6: "All `/api/*` require `Authorization: Bearer
/// <token>`"; WebSocket auth goes through [`validate_ws_query`] instead).
pub async fn auth_layer(State(state): State<Arc<AppState>>, req: Request<axum::body::Body>, next: Next) -> Response {
    let path = req.uri().path();
    if path == "/health" || path == "/metrics" || path.starts_with("/ws/") {
        return next.run(req).await;
    }
    if path.starts_with("/api/") && validate_bearer(req.headers(), state.auth_token.as_deref()).is_err() {
        return unauthorized();
    }
    next.run(req).await
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
