// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use crate::storage::MemoryStorage;

use super::*;

fn info(id: &str) -> SessionInfo {
    SessionInfo {
        id: id.to_owned(),
        adapter_name: "claude".into(),
        cwd: "/tmp".into(),
        model: None,
        permission_mode: None,
        created_at: 0,
        archived: false,
        name: None,
        lifecycle_state: LifecycleState::Starting,
        pid: None,
        backend_session_id: None,
        exit_code: None,
    }
}

fn registry(max: usize) -> SessionRegistry {
    SessionRegistry::new(Arc::new(MemoryStorage::default()), max)
}

#[tokio::test]
async fn register_then_get_round_trips() {
    let registry = registry(4);
    registry.register(info("s1")).await.unwrap();
    let got = registry.get_session("s1").await.unwrap();
    assert_eq!(got.id, "s1");
}

#[tokio::test]
async fn register_is_idempotent_for_existing_id() {
    let registry = registry(1);
    registry.register(info("s1")).await.unwrap();
    // Re-registering the same id must not count against the ceiling.
    registry.register(info("s1")).await.unwrap();
}

#[tokio::test]
async fn register_enforces_max_concurrent_sessions() {
    let registry = registry(1);
    registry.register(info("s1")).await.unwrap();
    let err = registry.register(info("s2")).await.unwrap_err();
    assert!(matches!(err, BrokerError::SessionLimitReached(1)));
}

#[tokio::test]
async fn mark_connected_updates_lifecycle_state() {
    let registry = registry(4);
    registry.register(info("s1")).await.unwrap();
    registry.mark_connected("s1").await.unwrap();
    let got = registry.get_session("s1").await.unwrap();
    assert_eq!(got.lifecycle_state, LifecycleState::Connected);
}

#[tokio::test]
async fn prune_exited_drops_only_exited_sessions() {
    let registry = registry(4);
    registry.register(info("s1")).await.unwrap();
    registry.register(info("s2")).await.unwrap();
    registry.mark_exited("s1", Some(0)).await.unwrap();

    registry.prune_exited().await;

    assert!(registry.get_session("s1").await.is_none());
    assert!(registry.get_session("s2").await.is_some());
}

#[tokio::test]
async fn restore_from_storage_marks_dead_pid_exited_with_code_minus_one() {
    let storage = Arc::new(MemoryStorage::default());
    let mut entry = info("s1");
    // A pid that is virtually certain not to be alive in this process tree.
    entry.pid = Some(u32::MAX - 1);
    storage.save_launcher(&entry).await.unwrap();

    let registry = SessionRegistry::new(storage, 4);
    registry.restore_from_storage().await.unwrap();

    let got = registry.get_session("s1").await.unwrap();
    assert_eq!(got.lifecycle_state, LifecycleState::Exited);
    assert_eq!(got.exit_code, Some(-1));
}

#[tokio::test]
async fn remove_session_errors_on_unknown_id() {
    let registry = registry(4);
    let err = registry.remove_session("missing").await.unwrap_err();
    assert!(matches!(err, BrokerError::SessionNotFound(_)));
}
