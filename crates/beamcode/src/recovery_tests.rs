// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::*;
use crate::adapter::{AdapterCapabilities, BackendAdapter, BackendAdapterSession, ConnectOptions};
use crate::coordinator::{CreateSessionOpts, SessionCoordinator};
use crate::message::UnifiedMessage;
use crate::storage::MemoryStorage;

struct FakeAdapterSession {
    inbound: Mutex<mpsc::UnboundedReceiver<UnifiedMessage>>,
}

#[async_trait]
impl BackendAdapterSession for FakeAdapterSession {
    async fn recv(&self) -> Option<UnifiedMessage> {
        self.inbound.lock().await.recv().await
    }

    async fn send(&self, _msg: &UnifiedMessage) -> BrokerResult<()> {
        Ok(())
    }

    async fn close(&self) {}
}

struct FakeAdapter {
    connects: Arc<std::sync::atomic::AtomicUsize>,
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
        self.connects.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let (_tx, rx) = mpsc::unbounded_channel();
        Ok(Arc::new(FakeAdapterSession { inbound: Mutex::new(rx) }))
    }
}

async fn test_coordinator(connects: Arc<std::sync::atomic::AtomicUsize>) -> Arc<SessionCoordinator> {
    let bus = EventBus::default();
    let registry = Arc::new(crate::registry::SessionRegistry::new(Arc::new(MemoryStorage::default()), 16));
    let storage: Arc<dyn crate::storage::Storage> = Arc::new(MemoryStorage::default());
    let mut adapters: HashMap<String, Arc<dyn BackendAdapter>> = HashMap::new();
    adapters.insert("fake".into(), Arc::new(FakeAdapter { connects }));

    let tracer = Arc::new(crate::tracer::Tracer::new(crate::tracer::TracerConfig {
        enabled: false,
        full: false,
        allow_sensitive: false,
        prometheus_enabled: false,
    }));
    let coordinator = SessionCoordinator::new(bus, registry, storage, adapters, "fake".into(), true, tracer);
    coordinator.start().await.unwrap();
    coordinator
}

#[tokio::test]
async fn maybe_recover_skips_archived_sessions() {
    let connects = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let coordinator = test_coordinator(Arc::clone(&connects)).await;
    let info = coordinator
        .create_session(CreateSessionOpts { cwd: "/tmp".into(), model: None, permission_mode: None, adapter_name: None })
        .await
        .unwrap();
    coordinator.registry().set_archived(&info.id, true).await.unwrap();

    let recovery = RecoveryService::new(coordinator.bus(), Arc::downgrade(&coordinator), RecoveryConfig::default());
    recovery.maybe_recover(&info.id).await;

    assert_eq!(connects.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn maybe_recover_reconnects_direct_connect_session_without_a_backend() {
    let connects = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let coordinator = test_coordinator(Arc::clone(&connects)).await;
    let info = coordinator
        .create_session(CreateSessionOpts { cwd: "/tmp".into(), model: None, permission_mode: None, adapter_name: None })
        .await
        .unwrap();
    // `no_auto_launch` left the session registered with no backend attached.

    let recovery = RecoveryService::new(coordinator.bus(), Arc::downgrade(&coordinator), RecoveryConfig::default());
    recovery.maybe_recover(&info.id).await;

    assert_eq!(connects.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn still_connecting_is_decided_by_lifecycle_state_alone() {
    // A mid-handshake inverted-connection session has no backend attached
    // yet, but must still be treated as "still connecting" (spec.md §4.10) —
    // `has_backend` cannot gate this, since it only becomes true once the
    // handshake that this check exists to protect has already finished.
    assert!(is_still_connecting(LifecycleState::Starting));
    assert!(!is_still_connecting(LifecycleState::Connected));
    assert!(!is_still_connecting(LifecycleState::Exited));
}

#[tokio::test]
async fn maybe_recover_dedups_concurrent_attempts_for_the_same_session() {
    let connects = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let coordinator = test_coordinator(Arc::clone(&connects)).await;
    let info = coordinator
        .create_session(CreateSessionOpts { cwd: "/tmp".into(), model: None, permission_mode: None, adapter_name: None })
        .await
        .unwrap();

    let recovery = RecoveryService::new(
        coordinator.bus(),
        Arc::downgrade(&coordinator),
        RecoveryConfig { relaunch_dedup: Duration::from_millis(200), ..RecoveryConfig::default() },
    );

    let a = recovery.maybe_recover(&info.id);
    let b = recovery.maybe_recover(&info.id);
    tokio::join!(a, b);

    // The second call observes the dedup marker the first call sets before
    // either awaits the adapter connect, so only one connect happens.
    assert_eq!(connects.load(std::sync::atomic::Ordering::SeqCst), 1);
}
