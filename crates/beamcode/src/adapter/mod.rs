// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Backend Adapter (spec.md §4.1) — the broker's one point of
//! polymorphism. Every vendor CLI is reached through the same two traits;
//! wire-level parsing of any given vendor's frames is intentionally a black
//! box (spec.md's own scoping note) — each adapter implements enough of its
//! outer shell (connect/send/close, the initialize-timeout contract, a
//! best-effort translation to [`UnifiedMessage`]) to be driven end-to-end
//! without claiming full fidelity to the vendor's actual protocol.

pub mod acp;
pub mod claude;
pub mod codex;
pub mod gemini;
pub mod opencode;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::bus::EventBus;
use crate::error::{BrokerError, BrokerResult};
use crate::message::UnifiedMessage;

/// Default window an adapter's `connect` is allowed to take before the
/// handshake is abandoned (spec.md §4.1).
pub const DEFAULT_INITIALIZE_TIMEOUT: Duration = Duration::from_secs(20);

/// Capability flags a mediator/coordinator can branch on without knowing
/// which vendor is behind the adapter (spec.md §4.1).
#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterCapabilities {
    pub streaming: bool,
    pub permissions: bool,
    pub slash_commands: bool,
    pub availability: bool,
    pub teams: bool,
}

/// Arguments to `BackendAdapter::connect`.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub session_id: String,
    pub cwd: String,
    pub resume: Option<String>,
    pub adapter_options: Value,
}

/// Callback a lifecycle manager may install to intercept outbound frames
/// that should be swallowed locally instead of forwarded (spec.md §4.5:
/// "short-circuits echoes for pending passthrough slash commands"). Returns
/// `true` if the message was handled and must not reach the adapter.
pub type PassthroughHandler = Arc<dyn Fn(&UnifiedMessage) -> bool + Send + Sync>;

/// A live connection to one backend instance (spec.md §4.1's
/// `AdapterSession`).
#[async_trait]
pub trait BackendAdapterSession: Send + Sync {
    /// Pull the next inbound frame. Returns `None` once the underlying
    /// transport has ended — this is the only disconnect signal a caller
    /// gets; there is no separate `closed` flag to race against.
    async fn recv(&self) -> Option<UnifiedMessage>;

    /// Forward an outbound frame. May fail if the transport already closed.
    async fn send(&self, msg: &UnifiedMessage) -> BrokerResult<()>;

    /// Forward a raw byte frame, for adapters that expose it (spec.md
    /// §4.1: "optional, not all adapters expose"). Direct-connect JSON
    /// adapters generally don't need this.
    async fn send_raw(&self, _bytes: Bytes) -> BrokerResult<()> {
        Err(BrokerError::Other(anyhow::anyhow!("sendRaw is not supported by this adapter")))
    }

    fn supports_send_raw(&self) -> bool {
        false
    }

    /// Idempotent teardown.
    async fn close(&self);

    /// Install a passthrough interceptor. Adapters that don't support
    /// passthrough slash commands leave this a no-op.
    fn set_passthrough_handler(&self, _handler: PassthroughHandler) {}
}

/// A vendor backend's connection factory (spec.md §4.1's `BackendAdapter`).
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn capabilities(&self) -> AdapterCapabilities;
    async fn connect(&self, opts: ConnectOptions) -> BrokerResult<Arc<dyn BackendAdapterSession>>;
}

/// The adapter kinds named in spec.md §4.1's variant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum AdapterKind {
    Claude,
    Codex,
    Gemini,
    Opencode,
    Acp,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::Opencode => "opencode",
            Self::Acp => "acp",
        }
    }
}

/// Construct the adapter implementation for a configured kind. `inverted`
/// is shared across every Claude-mode session; adapters that don't use
/// inverted connections ignore it.
pub fn build(
    kind: AdapterKind,
    bus: EventBus,
    inverted: Arc<InvertedRegistry>,
    binary: Option<String>,
) -> Arc<dyn BackendAdapter> {
    match kind {
        AdapterKind::Claude => Arc::new(claude::ClaudeAdapter::new(bus, inverted, binary)),
        AdapterKind::Codex => Arc::new(codex::CodexAdapter::new(bus, binary)),
        AdapterKind::Gemini => Arc::new(gemini::GeminiAdapter::new(bus, binary)),
        AdapterKind::Opencode => Arc::new(opencode::OpenCodeAdapter::new(bus, binary)),
        AdapterKind::Acp => Arc::new(acp::AcpAdapter::new(bus, binary)),
    }
}

/// Keyed rendezvous for the Claude SDK's inverted connection (spec.md
/// §4.1: "requires a WS registry keyed by sessionId"). The coordinator's
/// CLI WebSocket route calls [`InvertedRegistry::claim`] when a socket
/// arrives at `/ws/cli/:sid`; the Claude adapter's `connect` awaits
/// [`InvertedRegistry::reserve`]'s receiver.
#[derive(Default)]
pub struct InvertedRegistry {
    waiters: Mutex<HashMap<String, oneshot::Sender<axum::extract::ws::WebSocket>>>,
}

impl InvertedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a future inbound socket for `session_id`,
    /// returning the receiving half.
    pub async fn reserve(
        &self,
        session_id: &str,
    ) -> oneshot::Receiver<axum::extract::ws::WebSocket> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(session_id.to_owned(), tx);
        rx
    }

    /// Called by the HTTP facade's CLI WebSocket upgrade handler when the
    /// launched CLI dials back in. Returns `false` if nothing was waiting
    /// (stale or unknown session id).
    pub async fn claim(&self, session_id: &str, socket: axum::extract::ws::WebSocket) -> bool {
        if let Some(tx) = self.waiters.lock().await.remove(session_id) {
            tx.send(socket).is_ok()
        } else {
            false
        }
    }

    /// Drop a reservation that will never be fulfilled (connect timeout).
    pub async fn cancel(&self, session_id: &str) {
        self.waiters.lock().await.remove(session_id);
    }
}

/// Best-effort translation of a vendor text frame into a `UnifiedMessage`.
/// If the frame already parses as one (the common case for adapters whose
/// SDK speaks our envelope shape closely enough), it's used as-is;
/// otherwise it's wrapped as an opaque assistant text block rather than
/// dropped, so a downstream consumer still sees *something* for every
/// vendor frame.
pub fn best_effort_decode(text: &str) -> UnifiedMessage {
    match serde_json::from_str::<UnifiedMessage>(text) {
        Ok(msg) => msg,
        Err(_) => UnifiedMessage::new(crate::message::MessageType::Assistant, crate::message::Role::Assistant)
            .with_content(vec![crate::message::ContentBlock::Text { text: text.to_owned() }]),
    }
}

/// Serialize an outbound message for adapters that speak JSON-over-text
/// transports. The fixed `user_message`/`permission_response`/`interrupt`
/// mapping named in spec.md §4.1 is the envelope itself; per-vendor
/// re-encoding is the black-box part each adapter would own.
pub fn encode_outbound(msg: &UnifiedMessage) -> BrokerResult<String> {
    serde_json::to_string(msg).map_err(|e| BrokerError::Other(e.into()))
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
