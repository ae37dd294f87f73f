// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket upgrade handlers (spec.md §6): the consumer-facing fan-out
//! socket and the inverted-connection CLI socket the Claude adapter family
//! dials back into.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{auth, AppState};
use crate::ratelimit::{RateLimiter, RateLimiterConfig};
use crate::session::{Consumer, ConsumerRole, ConsumerTransport};

/// Query parameters accepted by the consumer WebSocket upgrade. Role and
/// identity assignment is the "injected authenticator" spec.md §6 names;
/// this build resolves it from the query string rather than a pluggable
/// hook, the simplest concrete instance of that contract.
#[derive(Debug, Deserialize)]
pub struct ConsumerQuery {
    pub token: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

enum WsOutbound {
    Text(String),
    Close(u16, String),
}

/// A consumer WebSocket, addressable from any task via an unbounded
/// channel. `buffered_amount` tracks bytes handed to the channel but not
/// yet written to the socket, standing in for the browser-side
/// `bufferedAmount` the broadcaster's high-water-mark check is named after
/// (spec.md §4.6).
struct WsConsumerTransport {
    tx: mpsc::UnboundedSender<WsOutbound>,
    buffered: Arc<AtomicUsize>,
}

impl ConsumerTransport for WsConsumerTransport {
    fn send(&self, text: String) -> anyhow::Result<()> {
        self.buffered.fetch_add(text.len(), Ordering::SeqCst);
        self.tx.send(WsOutbound::Text(text)).map_err(|e| anyhow::anyhow!("consumer channel closed: {e}"))
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(WsOutbound::Close(code, reason.to_owned()));
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::UnboundedReceiver<WsOutbound>, buffered: Arc<AtomicUsize>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WsOutbound::Text(text) => {
                let len = text.len();
                if sink.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
                buffered.fetch_sub(len, Ordering::SeqCst);
            }
            WsOutbound::Close(code, reason) => {
                let _ = sink.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
                return;
            }
        }
    }
}

/// `GET /ws/consumer/:sessionId` (spec.md §6).
pub async fn consumer_ws_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<ConsumerQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if auth::validate_ws_query(query.token.as_deref(), state.auth_token.as_deref()).is_err() {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    if state.coordinator.get_session(&session_id).await.is_none() {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    }

    let role = match query.role.as_deref() {
        Some("observer") => ConsumerRole::Observer,
        _ => ConsumerRole::Participant,
    };
    ws.on_upgrade(move |socket| handle_consumer_ws(socket, state, session_id, role, query.user_id, query.display_name))
}

async fn handle_consumer_ws(
    socket: WebSocket,
    state: Arc<AppState>,
    session_id: String,
    role: ConsumerRole,
    user_id: Option<String>,
    display_name: Option<String>,
) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (sink, mut stream) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<WsOutbound>();
    let buffered = Arc::new(AtomicUsize::new(0));
    let writer = tokio::spawn(write_loop(sink, out_rx, Arc::clone(&buffered)));

    let transport = Arc::new(WsConsumerTransport { tx: out_tx.clone(), buffered: Arc::clone(&buffered) });
    let consumer = Consumer {
        connection_id: connection_id.clone(),
        role,
        user_id,
        display_name,
        transport,
        rate_limiter: Arc::new(RateLimiter::new(RateLimiterConfig::default())),
    };

    let frames = match state.coordinator.attach_consumer(&session_id, consumer).await {
        Ok(frames) => frames,
        Err(e) => {
            warn!(session_id = %session_id, err = %e, "consumer attach failed");
            let _ = out_tx.send(WsOutbound::Close(1011, "attach failed".to_owned()));
            drop(out_tx);
            let _ = writer.await;
            return;
        }
    };
    for frame in frames {
        match crate::adapter::encode_outbound(&frame) {
            Ok(text) => {
                let _ = out_tx.send(WsOutbound::Text(text));
            }
            Err(e) => warn!(err = %e, "failed to encode replay frame"),
        }
    }

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                state.coordinator.route_inbound_consumer_frame_by_id(&session_id, &connection_id, &text).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(session_id = %session_id, err = %e, "consumer websocket read error");
                break;
            }
        }
    }

    state.coordinator.detach_consumer(&session_id, &connection_id).await;
    drop(out_tx);
    let _ = writer.await;
}

/// `GET /ws/cli/:sessionId` — the Claude adapter family's inverted
/// connection (spec.md §6). Unknown session ids are rejected with close
/// code 4000 after the upgrade, since an HTTP-level rejection has no way
/// to carry a WebSocket close code.
pub async fn cli_ws_handler(State(state): State<Arc<AppState>>, Path(session_id): Path<String>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        if state.coordinator.get_session(&session_id).await.is_none() {
            reject_unknown_session(socket).await;
            return;
        }
        if !state.inverted.claim(&session_id, socket).await {
            debug!(session_id = %session_id, "no reservation waiting for inverted CLI socket");
        }
    })
}

async fn reject_unknown_session(mut socket: WebSocket) {
    let _ = socket.send(Message::Close(Some(CloseFrame { code: 4000, reason: "unknown session".into() }))).await;
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
