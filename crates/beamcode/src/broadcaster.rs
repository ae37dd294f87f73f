// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Consumer Broadcaster (spec.md §4.6) — per-session fan-out to attached
//! WebSocket consumers, replay-on-attach, and backpressure enforcement.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::bus::{DomainEvent, EventBus};
use crate::error::{BrokerError, BrokerResult};
use crate::message::{MessageType, Role, UnifiedMessage};
use crate::session::{Consumer, ConsumerRole, Session};

/// Per-consumer high-water mark; exceeding it closes the transport with
/// code 1009 rather than let a slow consumer hold the broadcaster (spec.md
/// §4.6).
pub const DEFAULT_HIGH_WATER_MARK: usize = 4 * 1024 * 1024;
/// Any inbound consumer frame larger than this closes the transport with
/// code 1009 (spec.md §4.6).
pub const DEFAULT_INBOUND_LIMIT: usize = 256 * 1024;

const CLOSE_CODE_TOO_BIG: u16 = 1009;
const CLOSE_CODE_NORMAL: u16 = 1000;

pub struct ConsumerBroadcaster {
    bus: EventBus,
    high_water_mark: usize,
    inbound_limit: usize,
}

impl ConsumerBroadcaster {
    pub fn new(bus: EventBus) -> Self {
        Self { bus, high_water_mark: DEFAULT_HIGH_WATER_MARK, inbound_limit: DEFAULT_INBOUND_LIMIT }
    }

    /// Reject an inbound consumer frame before it ever reaches routing
    /// (spec.md §4.6: "causes the broadcaster's ingress path to close the
    /// transport with code 1009").
    pub fn check_inbound_size(&self, len: usize) -> BrokerResult<()> {
        if len > self.inbound_limit {
            Err(BrokerError::InvalidFrame(format!(
                "frame of {len} bytes exceeds the {}-byte inbound limit",
                self.inbound_limit
            )))
        } else {
            Ok(())
        }
    }

    /// Attach a consumer, returning the `session_init` + bounded replay the
    /// caller must send immediately (spec.md §4.6).
    pub async fn attach(&self, session: Arc<Mutex<Session>>, consumer: Consumer) -> Vec<UnifiedMessage> {
        let connection_id = consumer.connection_id.clone();
        let (session_init, replay, cli_connected, session_id) = {
            let mut guard = session.lock().await;
            let init = UnifiedMessage::new(MessageType::SessionInit, Role::System)
                .with_metadata("state", serde_json::to_value(guard.state.as_ref()).unwrap_or_default());
            let replay = guard.replay_snapshot();
            let cli_connected = guard.adapter_session.is_some();
            guard.consumers.insert(connection_id.clone(), consumer);
            (init, replay, cli_connected, guard.id.clone())
        };

        self.bus.publish(DomainEvent::ConsumerConnected { session_id: session_id.clone(), connection_id });

        let mut frames = Vec::with_capacity(replay.len() + 2);
        frames.push(session_init);
        if cli_connected {
            frames.push(UnifiedMessage::new(MessageType::CliConnected, Role::System));
        }
        frames.extend(replay);
        frames
    }

    pub async fn detach(&self, session: Arc<Mutex<Session>>, connection_id: &str) {
        let session_id = {
            let mut guard = session.lock().await;
            guard.consumers.shift_remove(connection_id);
            guard.id.clone()
        };
        self.bus.publish(DomainEvent::ConsumerDisconnected {
            session_id,
            connection_id: connection_id.to_owned(),
        });
    }

    /// Send to every attached consumer, serializing the frame once.
    pub async fn broadcast(&self, session: Arc<Mutex<Session>>, msg: &UnifiedMessage) {
        self.send_filtered(session, msg, |_| true).await;
    }

    /// Send only to consumers whose role is `participant`.
    pub async fn broadcast_to_participants(&self, session: Arc<Mutex<Session>>, msg: &UnifiedMessage) {
        self.send_filtered(session, msg, |c| c.role == ConsumerRole::Participant).await;
    }

    pub async fn send_to(&self, consumer: &Consumer, msg: &UnifiedMessage) -> BrokerResult<()> {
        let text = crate::adapter::encode_outbound(msg)?;
        consumer.transport.send(text).map_err(|e| BrokerError::InvalidFrame(e.to_string()))
    }

    async fn send_filtered(
        &self,
        session: Arc<Mutex<Session>>,
        msg: &UnifiedMessage,
        keep: impl Fn(&Consumer) -> bool,
    ) {
        let text = match crate::adapter::encode_outbound(msg) {
            Ok(text) => text,
            Err(e) => {
                warn!(err = %e, "failed to serialize outbound broadcast message");
                return;
            }
        };

        let (session_id, overflowing) = {
            let guard = session.lock().await;
            let mut overflowing = Vec::new();
            for consumer in guard.consumers.values().filter(|c| keep(c)) {
                if consumer.transport.buffered_amount() > self.high_water_mark {
                    overflowing.push(consumer.connection_id.clone());
                    continue;
                }
                if let Err(e) = consumer.transport.send(text.clone()) {
                    warn!(connection_id = %consumer.connection_id, err = %e, "consumer send failed");
                }
            }
            (guard.id.clone(), overflowing)
        };

        for connection_id in overflowing {
            self.close_overflowing(Arc::clone(&session), &connection_id).await;
        }
        let _ = session_id;
    }

    async fn close_overflowing(&self, session: Arc<Mutex<Session>>, connection_id: &str) {
        let removed = {
            let mut guard = session.lock().await;
            guard.consumers.shift_remove(connection_id)
        };
        if let Some(consumer) = removed {
            warn!(connection_id, "consumer exceeded buffered-amount high water mark, closing");
            consumer.transport.close(CLOSE_CODE_TOO_BIG, "buffered amount exceeded");
        }
        self.detach(session, connection_id).await;
    }

    /// Close and detach a consumer whose inbound frame exceeded the
    /// ingress size limit (spec.md §4.6).
    pub async fn reject_oversize(&self, session: Arc<Mutex<Session>>, connection_id: &str) {
        self.close_overflowing(session, connection_id).await;
    }

    /// Detach every consumer with a normal close, used by
    /// `deleteSession` (spec.md §4.9).
    pub async fn close_all(&self, session: Arc<Mutex<Session>>) {
        let consumers = {
            let mut guard = session.lock().await;
            std::mem::take(&mut guard.consumers)
        };
        for (_, consumer) in consumers {
            consumer.transport.close(CLOSE_CODE_NORMAL, "session deleted");
        }
    }
}

#[cfg(test)]
#[path = "broadcaster_tests.rs"]
mod tests;
