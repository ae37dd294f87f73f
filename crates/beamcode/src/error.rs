// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Normalized terminal error codes carried in `result{is_error: true}`
/// messages and `error` events (spec.md §4.1, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RateLimit,
    OutputLength,
    Aborted,
    ExecutionError,
    ApiError,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::OutputLength => "output_length",
            Self::Aborted => "aborted",
            Self::ExecutionError => "execution_error",
            Self::ApiError => "api_error",
            Self::Unknown => "unknown",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::RateLimit => 429,
            Self::OutputLength => 413,
            Self::Aborted => 409,
            Self::ExecutionError => 500,
            Self::ApiError => 502,
            Self::Unknown => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The core's typed error type. The binary's outermost boundary converts
/// this to a process exit code or an HTTP status; nothing inside the core
/// ever unwraps or panics on these.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid binary path: {0}")]
    InvalidBinaryPath(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("adapter connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("adapter connect failed: {0}")]
    ConnectFailed(String),

    #[error("backend session is closed")]
    BackendClosed,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session limit reached ({0} max concurrent sessions)")]
    SessionLimitReached(usize),

    #[error("session already exists: {0}")]
    SessionExists(String),

    #[error("unknown permission request: {0}")]
    UnknownPermissionRequest(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid consumer frame: {0}")]
    InvalidFrame(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
