// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::*;
use crate::adapter::{AdapterCapabilities, BackendAdapter, BackendAdapterSession, ConnectOptions};
use crate::message::{MessageType, Role};
use crate::session::Session;

struct FakeAdapterSession {
    inbound: Mutex<mpsc::UnboundedReceiver<UnifiedMessage>>,
    sent: Arc<Mutex<Vec<UnifiedMessage>>>,
}

#[async_trait]
impl BackendAdapterSession for FakeAdapterSession {
    async fn recv(&self) -> Option<UnifiedMessage> {
        self.inbound.lock().await.recv().await
    }

    async fn send(&self, msg: &UnifiedMessage) -> BrokerResult<()> {
        self.sent.lock().await.push(msg.clone());
        Ok(())
    }

    async fn close(&self) {}
}

struct FakeAdapter {
    feed: Mutex<Option<mpsc::UnboundedSender<UnifiedMessage>>>,
    sent: Arc<Mutex<Vec<UnifiedMessage>>>,
}

#[async_trait]
impl BackendAdapter for FakeAdapter {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    async fn connect(&self, _opts: ConnectOptions) -> BrokerResult<Arc<dyn BackendAdapterSession>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.feed.lock().await = Some(tx);
        Ok(Arc::new(FakeAdapterSession { inbound: Mutex::new(rx), sent: Arc::clone(&self.sent) }))
    }
}

fn test_session() -> Arc<Mutex<Session>> {
    Arc::new(Mutex::new(Session::new("s1".into(), "fake".into(), "/tmp".into())))
}

fn test_tracer_config() -> crate::tracer::TracerConfig {
    crate::tracer::TracerConfig { enabled: false, full: false, allow_sensitive: false, prometheus_enabled: false }
}

#[tokio::test]
async fn connect_backend_installs_adapter_session_and_routes_messages() {
    let routed = Arc::new(AtomicUsize::new(0));
    let routed_clone = Arc::clone(&routed);
    let router: RouteFn = Arc::new(move |_session, _msg| {
        let routed = Arc::clone(&routed_clone);
        Box::pin(async move {
            routed.fetch_add(1, Ordering::SeqCst);
        })
    });

    let bus = EventBus::default();
    let manager = BackendLifecycleManager::new(bus.clone(), router, Arc::new(crate::tracer::Tracer::new(test_tracer_config())));
    let sent = Arc::new(Mutex::new(Vec::new()));
    let adapter = Arc::new(FakeAdapter { feed: Mutex::new(None), sent: Arc::clone(&sent) });

    let session = test_session();
    let opts = ConnectOptions { session_id: "s1".into(), cwd: "/tmp".into(), resume: None, adapter_options: serde_json::Value::Null };
    manager.connect_backend(Arc::clone(&session), adapter.clone(), opts).await.unwrap();

    assert!(session.lock().await.adapter_session.is_some());

    let feed = adapter.feed.lock().await.clone().unwrap();
    feed.send(UnifiedMessage::new(MessageType::Assistant, Role::Assistant)).unwrap();

    // Give the spawned consumer loop a turn to observe and route it.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(routed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disconnect_backend_cancels_pending_permissions() {
    let router: RouteFn = Arc::new(|_session, _msg| Box::pin(async move {}));
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let manager = BackendLifecycleManager::new(bus, router, Arc::new(crate::tracer::Tracer::new(test_tracer_config())));

    let session = test_session();
    {
        let mut guard = session.lock().await;
        guard.pending_permissions.insert(
            "req-1".into(),
            crate::session::PendingPermission {
                request_id: "req-1".into(),
                tool_name: "Bash".into(),
                tool_use_id: None,
                requested_at: std::time::Instant::now(),
            },
        );
    }

    manager.disconnect_backend(Arc::clone(&session)).await;
    assert!(session.lock().await.pending_permissions.is_empty());

    let mut saw_resolved = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, DomainEvent::PermissionResolved { .. }) {
            saw_resolved = true;
        }
    }
    assert!(saw_resolved);
}

#[tokio::test]
async fn send_to_backend_errors_without_an_active_adapter_session() {
    let router: RouteFn = Arc::new(|_session, _msg| Box::pin(async move {}));
    let manager = BackendLifecycleManager::new(EventBus::default(), router, Arc::new(crate::tracer::Tracer::new(test_tracer_config())));
    let session = test_session();
    let err = manager
        .send_to_backend(session, UnifiedMessage::new(MessageType::UserMessage, Role::User))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::BackendClosed));
}
