// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The central `Session` entity (spec.md §3) and everything attached to it.
//!
//! Ownership follows spec.md §9's cycle-breaking rule: the `Session` owns
//! its `Consumer`s and its `BackendAdapterSession` handle; a `Consumer`
//! holds only a session id, never a back-pointer to the `Session`.

pub mod state;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::adapter::BackendAdapterSession;
use crate::message::UnifiedMessage;
use crate::ratelimit::RateLimiter;

pub use state::SessionState;

/// Registry-maintained launcher-visible lifecycle (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Starting,
    Connected,
    Exited,
}

/// Consumer role; only participants may mutate backend-facing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerRole {
    Participant,
    Observer,
}

/// Reply a consumer gives to a pending permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionBehavior {
    Allow,
    Deny,
    /// Persistent allow where the backend supports it; adapters that do
    /// not distinguish this collapse it to `Allow` (spec.md §4.7).
    Always,
}

impl PermissionBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Always => "always",
        }
    }
}

/// Minimal transport contract a consumer connection must satisfy (spec.md
/// §3: "only send(text), close(code, reason), bufferedAmount are used").
pub trait ConsumerTransport: Send + Sync {
    fn send(&self, text: String) -> anyhow::Result<()>;
    fn close(&self, code: u16, reason: &str);
    fn buffered_amount(&self) -> usize;
}

/// A browser WebSocket client attached to a session.
pub struct Consumer {
    pub connection_id: String,
    pub role: ConsumerRole,
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub transport: Arc<dyn ConsumerTransport>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("connection_id", &self.connection_id)
            .field("role", &self.role)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// A tool-use authorization request from the backend awaiting a consumer
/// decision (spec.md §3, §4.7).
#[derive(Debug, Clone)]
pub struct PendingPermission {
    pub request_id: String,
    pub tool_name: String,
    pub tool_use_id: Option<String>,
    pub requested_at: Instant,
}

static NEXT_SESSION_SEQ: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique, never-reused session id (spec.md §3).
pub fn new_session_id() -> String {
    let seq = NEXT_SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("sess-{}-{seq}", uuid::Uuid::new_v4().simple())
}

pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// The central session entity. Owned exclusively by the Session Coordinator
/// (spec.md §3 "Ownership & lifecycle"); other components act on it only
/// through the coordinator's owning task.
pub struct Session {
    pub id: String,
    pub adapter_name: String,
    pub cwd: String,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub created_at: u64,
    pub archived: bool,
    pub name: Option<String>,
    pub lifecycle_state: LifecycleState,
    pub pid: Option<u32>,
    pub backend_session_id: Option<String>,

    pub adapter_session: Option<Arc<dyn BackendAdapterSession>>,
    pub consumer_loop: Option<crate::lifecycle::ConsumerLoopHandle>,
    /// `Arc`-wrapped so the State Reducer's referential-equality discipline
    /// (spec.md §4.8, §8 invariant #1) is checkable with `Arc::ptr_eq`
    /// rather than a `PartialEq` diff.
    pub state: Arc<SessionState>,

    history: VecDeque<UnifiedMessage>,
    history_cap: usize,
    pub replay_cap: usize,

    pub pending_messages: Vec<UnifiedMessage>,
    pub pending_permissions: IndexMap<String, PendingPermission>,
    pub consumers: IndexMap<String, Consumer>,

    /// Team-tool correlation buffer (spec.md §4.8): tool_uses from the
    /// fixed team toolset, keyed by `tool_use_id`, awaiting their
    /// `tool_result`. Lives on `Session` rather than behind its own lock
    /// since the reducer always runs under the session's owning task.
    pub team_buffer: IndexMap<String, crate::reducer::BufferedToolUse>,

    pub last_activity: Instant,
}

/// Default cap on `messageHistory` (spec.md §3: "default 10 000").
pub const DEFAULT_HISTORY_CAP: usize = 10_000;
/// Default replay cap for newly attached consumers (spec.md §4.6).
pub const DEFAULT_REPLAY_CAP: usize = 100;

impl Session {
    pub fn new(id: String, adapter_name: String, cwd: String) -> Self {
        assert!(
            DEFAULT_HISTORY_CAP >= DEFAULT_REPLAY_CAP,
            "messageHistory cap must be >= the replay cap (spec.md §9 open question)"
        );
        Self {
            state: Arc::new(SessionState::new(id.clone())),
            id,
            adapter_name,
            cwd,
            model: None,
            permission_mode: None,
            created_at: epoch_ms(),
            archived: false,
            name: None,
            lifecycle_state: LifecycleState::Starting,
            pid: None,
            backend_session_id: None,
            adapter_session: None,
            consumer_loop: None,
            history: VecDeque::new(),
            history_cap: DEFAULT_HISTORY_CAP,
            replay_cap: DEFAULT_REPLAY_CAP,
            pending_messages: Vec::new(),
            pending_permissions: IndexMap::new(),
            consumers: IndexMap::new(),
            team_buffer: IndexMap::new(),
            last_activity: Instant::now(),
        }
    }

    /// Append-only; trimming drops from the head once `history_cap` is
    /// exceeded (spec.md §3).
    pub fn push_history(&mut self, msg: UnifiedMessage) {
        self.history.push_back(msg);
        while self.history.len() > self.history_cap {
            self.history.pop_front();
        }
    }

    /// The bounded replay a newly attached consumer receives (spec.md §4.6).
    pub fn replay_snapshot(&self) -> Vec<UnifiedMessage> {
        let len = self.history.len();
        let skip = len.saturating_sub(self.replay_cap);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn participant_connections(&self) -> Vec<&Consumer> {
        self.consumers.values().filter(|c| c.role == ConsumerRole::Participant).collect()
    }
}

/// The subset of `Session` persisted and owned by the Session Registry
/// (spec.md §3: "The Registry holds lifecycle fields for persistence").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub adapter_name: String,
    pub cwd: String,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub created_at: u64,
    pub archived: bool,
    pub name: Option<String>,
    pub lifecycle_state: LifecycleState,
    pub pid: Option<u32>,
    pub backend_session_id: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl From<&Session> for SessionInfo {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            adapter_name: s.adapter_name.clone(),
            cwd: s.cwd.clone(),
            model: s.model.clone(),
            permission_mode: s.permission_mode.clone(),
            created_at: s.created_at,
            archived: s.archived,
            name: s.name.clone(),
            lifecycle_state: s.lifecycle_state,
            pid: s.pid,
            backend_session_id: s.backend_session_id.clone(),
            exit_code: None,
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
