// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;

#[test]
fn error_code_round_trips_as_str() {
    for code in [
        ErrorCode::RateLimit,
        ErrorCode::OutputLength,
        ErrorCode::Aborted,
        ErrorCode::ExecutionError,
        ErrorCode::ApiError,
        ErrorCode::Unknown,
    ] {
        let json = serde_json::to_string(&code).unwrap();
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
        assert_eq!(format!("{code}"), code.as_str());
    }
}

#[test]
fn http_status_is_client_error_for_rate_limit() {
    assert_eq!(ErrorCode::RateLimit.http_status(), 429);
    assert_eq!(ErrorCode::OutputLength.http_status(), 413);
}
