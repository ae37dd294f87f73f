// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Unified Message envelope (spec.md §3) — the single message type that
//! crosses every component boundary in the broker.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;

/// Closed enumeration of Unified Message types (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    SessionInit,
    StatusChange,
    Result,
    Assistant,
    UserMessage,
    StreamEvent,
    ToolProgress,
    ToolUseSummary,
    PermissionRequest,
    PermissionResponse,
    PermissionCancelled,
    Interrupt,
    ControlRequest,
    ControlResponse,
    AuthStatus,
    SlashCommandResult,
    SlashCommandError,
    CliConnected,
    CliDisconnected,
    Error,
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// An ordered content block within a message (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Refusal,
}

/// The envelope traversing the core. Immutable once constructed; `id` is
/// assigned by [`UnifiedMessage::new`] and never changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl UnifiedMessage {
    /// Construct a new message with a fresh, process-unique, monotonically
    /// increasing id. Ids are never reused for the lifetime of the process.
    pub fn new(message_type: MessageType, role: Role) -> Self {
        let seq = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("msg-{seq}"),
            message_type,
            role,
            content: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_content(mut self, content: Vec<ContentBlock>) -> Self {
        self.content = content;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(Value::as_f64)
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(Value::as_u64)
    }

    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(Value::as_bool)
    }

    /// Build a synthetic `error` message, used whenever the broker rejects
    /// a frame locally rather than forwarding it to a backend (spec.md §4.6,
    /// §4.9, §7).
    pub fn synthetic_error(message: impl Into<String>, code: ErrorCode) -> Self {
        UnifiedMessage::new(MessageType::Error, Role::System)
            .with_content(vec![ContentBlock::Text { text: message.into() }])
            .with_metadata("error_code", code.as_str())
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
