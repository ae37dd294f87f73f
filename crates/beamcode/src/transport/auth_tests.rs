// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use axum::http::HeaderMap;

use super::*;

#[test]
fn validate_bearer_allows_everything_when_no_token_configured() {
    let headers = HeaderMap::new();
    assert!(validate_bearer(&headers, None).is_ok());
}

#[test]
fn validate_bearer_accepts_matching_token() {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer secret".parse().unwrap());
    assert!(validate_bearer(&headers, Some("secret")).is_ok());
}

#[test]
fn validate_bearer_rejects_mismatched_or_missing_header() {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer wrong".parse().unwrap());
    assert!(validate_bearer(&headers, Some("secret")).is_err());
    assert!(validate_bearer(&HeaderMap::new(), Some("secret")).is_err());
}

#[test]
fn validate_ws_query_matches_token_param() {
    assert!(validate_ws_query(Some("secret"), Some("secret")).is_ok());
    assert!(validate_ws_query(Some("wrong"), Some("secret")).is_err());
    assert!(validate_ws_query(None, Some("secret")).is_err());
    assert!(validate_ws_query(None, None).is_ok());
}
