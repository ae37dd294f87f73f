// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Permission Mediator (spec.md §4.7) — correlates backend permission
//! requests with consumer responses.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::broadcaster::ConsumerBroadcaster;
use crate::bus::{DomainEvent, EventBus};
use crate::error::{BrokerError, BrokerResult};
use crate::lifecycle::BackendLifecycleManager;
use crate::message::{MessageType, Role, UnifiedMessage};
use crate::session::{PendingPermission, Session};

/// `allow` / `deny` / `always` as carried on an inbound `permission_response`
/// (spec.md §4.7). Kept distinct from [`crate::session::PermissionBehavior`]
/// since the wire vocabulary and the persisted-record vocabulary happen to
/// coincide but are conceptually different contracts.
pub type Behavior = crate::session::PermissionBehavior;

pub struct PermissionMediator {
    bus: EventBus,
    lifecycle: Arc<BackendLifecycleManager>,
    broadcaster: Arc<ConsumerBroadcaster>,
}

impl PermissionMediator {
    pub fn new(bus: EventBus, lifecycle: Arc<BackendLifecycleManager>, broadcaster: Arc<ConsumerBroadcaster>) -> Self {
        Self { bus, lifecycle, broadcaster }
    }

    /// Handle an inbound `permission_request` from the backend: record it,
    /// persist it in history (so late joiners replay it), and broadcast to
    /// participants (spec.md §4.7).
    pub async fn on_request(&self, session: Arc<Mutex<Session>>, msg: &UnifiedMessage) {
        let Some(request_id) = msg.meta_str("request_id").map(str::to_owned) else {
            warn!("permission_request missing request_id, dropping");
            return;
        };
        let tool_name = msg.meta_str("tool_name").unwrap_or_default().to_owned();
        let tool_use_id = msg.meta_str("tool_use_id").map(str::to_owned);

        {
            let mut guard = session.lock().await;
            guard.pending_permissions.insert(
                request_id.clone(),
                PendingPermission { request_id: request_id.clone(), tool_name, tool_use_id, requested_at: Instant::now() },
            );
            guard.push_history(msg.clone());
        }

        self.broadcaster.broadcast_to_participants(session, msg).await;
    }

    /// Handle an inbound consumer `permission_response`: forward to the
    /// backend, clear the pending entry, emit `permission:resolved` (spec.md
    /// §4.7).
    pub async fn resolve(&self, session: Arc<Mutex<Session>>, request_id: &str, behavior: Behavior, updated_input: Option<Value>) -> BrokerResult<()> {
        let (session_id, found) = {
            let mut guard = session.lock().await;
            let found = guard.pending_permissions.shift_remove(request_id).is_some();
            (guard.id.clone(), found)
        };
        if !found {
            return Err(BrokerError::UnknownPermissionRequest(request_id.to_owned()));
        }

        let mut response = UnifiedMessage::new(MessageType::PermissionResponse, Role::User)
            .with_metadata("request_id", request_id)
            .with_metadata("behavior", behavior.as_str());
        if let Some(input) = updated_input {
            response = response.with_metadata("updated_input", input);
        }

        self.lifecycle.send_to_backend(Arc::clone(&session), response).await?;
        self.bus.publish(DomainEvent::PermissionResolved { session_id, request_id: request_id.to_owned() });
        Ok(())
    }

    /// Cancel every pending request on backend loss (spec.md §4.5, §4.7):
    /// broadcasts `permission_cancelled` for each, then clears the map.
    pub async fn cancel_all(&self, session: Arc<Mutex<Session>>) {
        let (session_id, cancelled): (String, Vec<String>) = {
            let mut guard = session.lock().await;
            let ids: Vec<String> = guard.pending_permissions.keys().cloned().collect();
            guard.pending_permissions.clear();
            (guard.id.clone(), ids)
        };

        for request_id in cancelled {
            let msg = UnifiedMessage::new(MessageType::PermissionCancelled, Role::System).with_metadata("request_id", request_id.clone());
            self.broadcaster.broadcast_to_participants(Arc::clone(&session), &msg).await;
            self.bus.publish(DomainEvent::PermissionResolved { session_id: session_id.clone(), request_id });
        }
    }

    /// Re-emit every still-pending request to a single newly attached
    /// consumer (spec.md §4.7 "late-join replay invariant"), as a defense in
    /// depth against history trimming.
    pub async fn replay_pending(&self, session: Arc<Mutex<Session>>) -> Vec<UnifiedMessage> {
        let guard = session.lock().await;
        guard
            .pending_permissions
            .values()
            .map(|p| {
                let mut msg = UnifiedMessage::new(MessageType::PermissionRequest, Role::System)
                    .with_metadata("request_id", p.request_id.clone())
                    .with_metadata("tool_name", p.tool_name.clone());
                if let Some(tool_use_id) = &p.tool_use_id {
                    msg = msg.with_metadata("tool_use_id", tool_use_id.clone());
                }
                msg
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "permission_tests.rs"]
mod tests;
