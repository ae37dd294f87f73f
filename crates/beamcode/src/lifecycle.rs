// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Backend Lifecycle Manager (spec.md §4.5) — per-session connect/disconnect
//! orchestration and the background consumer task that drains a backend
//! adapter session's inbound stream.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::adapter::{BackendAdapter, ConnectOptions};
use crate::bus::{DomainEvent, EventBus};
use crate::error::{BrokerError, BrokerResult, ErrorCode};
use crate::message::UnifiedMessage;
use crate::session::Session;
use crate::tracer::{Edge, Tracer};

/// Invoked for every inbound `UnifiedMessage` the backend produces, and for
/// the synthetic error this manager raises on a dirty disconnect. Boxed to
/// keep the manager free of a generic parameter tying it to one router
/// implementation (the coordinator owns routing; this only drains).
pub type RouteFn =
    Arc<dyn Fn(Arc<Mutex<Session>>, UnifiedMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct BackendLifecycleManager {
    bus: EventBus,
    router: RouteFn,
    tracer: Arc<Tracer>,
}

/// Handle to the background task draining one session's adapter session.
/// Stored on [`Session`] so [`BackendLifecycleManager::disconnect_backend`]
/// can signal it from any caller, not just the manager instance that
/// started it.
pub struct ConsumerLoopHandle {
    cancel: CancellationToken,
}

impl BackendLifecycleManager {
    pub fn new(bus: EventBus, router: RouteFn, tracer: Arc<Tracer>) -> Self {
        Self { bus, router, tracer }
    }

    /// `connectBackend` (spec.md §4.5 step 1).
    pub async fn connect_backend(
        &self,
        session: Arc<Mutex<Session>>,
        adapter: Arc<dyn BackendAdapter>,
        opts: ConnectOptions,
    ) -> BrokerResult<()> {
        self.disconnect_backend(Arc::clone(&session)).await;

        let adapter_session = adapter.connect(opts).await?;

        {
            let mut guard = session.lock().await;
            guard.adapter_session = Some(Arc::clone(&adapter_session));

            let pending = std::mem::take(&mut guard.pending_messages);
            if !pending.is_empty() {
                if adapter_session.supports_send_raw() {
                    for msg in pending {
                        if let Err(e) = adapter_session.send(&msg).await {
                            warn!(session_id = %guard.id, err = %e, "failed to flush pending message");
                        }
                    }
                } else {
                    warn!(
                        session_id = %guard.id,
                        dropped = "pending_messages",
                        "adapter lacks sendRaw; dropping queued frames on reconnect"
                    );
                }
            }
        }

        let cancel = CancellationToken::new();
        self.spawn_consumer_loop(Arc::clone(&session), Arc::clone(&adapter_session), cancel.clone());

        {
            let mut guard = session.lock().await;
            guard.consumer_loop = Some(ConsumerLoopHandle { cancel });
        }

        let session_id = session.lock().await.id.clone();
        self.bus.publish(DomainEvent::BackendConnected { session_id: session_id.clone() });
        self.bus.publish(DomainEvent::CliConnected { session_id });
        Ok(())
    }

    /// `disconnectBackend` (spec.md §4.5 step 2).
    pub async fn disconnect_backend(&self, session: Arc<Mutex<Session>>) {
        let (adapter_session, cancel, session_id, cancelled_permissions) = {
            let mut guard = session.lock().await;
            let adapter_session = guard.adapter_session.take();
            let cancel = guard.consumer_loop.take().map(|h| h.cancel);
            let pending: Vec<String> = guard.pending_permissions.keys().cloned().collect();
            guard.pending_permissions.clear();
            (adapter_session, cancel, guard.id.clone(), pending)
        };

        if let Some(cancel) = &cancel {
            cancel.cancel();
        }
        if let Some(adapter_session) = adapter_session {
            adapter_session.close().await;
        }

        self.bus.publish(DomainEvent::BackendDisconnected { session_id: session_id.clone() });
        self.bus.publish(DomainEvent::CliDisconnected { session_id: session_id.clone() });

        for request_id in cancelled_permissions {
            self.bus.publish(DomainEvent::PermissionResolved { session_id: session_id.clone(), request_id });
        }
    }

    /// `sendToBackend` (spec.md §4.5 step 3). Every outbound frame, no
    /// matter which component forwards it, crosses this one function — the
    /// single point the coordinator→backend tracer tap needs (SPEC_FULL.md
    /// §4.12).
    pub async fn send_to_backend(&self, session: Arc<Mutex<Session>>, msg: UnifiedMessage) -> BrokerResult<()> {
        self.tracer.on_message(Edge::CoordinatorToBackend, &msg);
        let adapter_session = session.lock().await.adapter_session.clone();
        match adapter_session {
            Some(adapter_session) => match adapter_session.send(&msg).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    let session_id = session.lock().await.id.clone();
                    error!(session_id = %session_id, err = %e, "send to backend failed");
                    Err(e)
                }
            },
            None => Err(BrokerError::BackendClosed),
        }
    }

    fn spawn_consumer_loop(
        &self,
        session: Arc<Mutex<Session>>,
        adapter_session: Arc<dyn crate::adapter::BackendAdapterSession>,
        cancel: CancellationToken,
    ) {
        let router = Arc::clone(&self.router);
        let bus = self.bus.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        // Abort-triggered termination is silent (spec.md §4.5).
                        return;
                    }
                    msg = adapter_session.recv() => {
                        match msg {
                            Some(msg) => {
                                {
                                    let mut guard = session.lock().await;
                                    guard.touch();
                                }
                                (router)(Arc::clone(&session), msg).await;
                            }
                            None => {
                                // Clean end of the inbound stream without an
                                // abort signal: treat as a dirty disconnect.
                                let session_id = session.lock().await.id.clone();
                                error!(session_id = %session_id, "backend stream ended unexpectedly");
                                let error_msg = UnifiedMessage::synthetic_error(
                                    "backend connection lost",
                                    ErrorCode::ExecutionError,
                                );
                                (router)(Arc::clone(&session), error_msg).await;
                                disconnect_dirty(&bus, Arc::clone(&session)).await;
                                return;
                            }
                        }
                    }
                }
            }
        });
    }
}

/// Shared tail of the "consumer loop ended without an abort" path (spec.md
/// §4.5): drop the adapter handle, cancel pending permissions, notify.
async fn disconnect_dirty(bus: &EventBus, session: Arc<Mutex<Session>>) {
    let (session_id, cancelled_permissions) = {
        let mut guard = session.lock().await;
        guard.adapter_session = None;
        guard.consumer_loop = None;
        let pending: Vec<String> = guard.pending_permissions.keys().cloned().collect();
        guard.pending_permissions.clear();
        (guard.id.clone(), pending)
    };
    bus.publish(DomainEvent::BackendDisconnected { session_id: session_id.clone() });
    bus.publish(DomainEvent::CliDisconnected { session_id: session_id.clone() });
    for request_id in cancelled_permissions {
        bus.publish(DomainEvent::PermissionResolved { session_id: session_id.clone(), request_id });
    }
    // A stream that ends without an explicit abort is exactly the signal
    // the Recovery Service watches for (spec.md §4.10): the backend is gone
    // but nothing asked for the session to be torn down.
    bus.publish(DomainEvent::RelaunchNeeded { session_id: session_id.clone() });
    debug!(session_id = %session_id, "session disconnected after stream error");
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
