// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Registry (spec.md §4.4) — source of truth for the set of
//! sessions and their launcher-visible lifecycle state.

use std::sync::Arc;

use indexmap::IndexMap;
use nix::sys::signal;
use nix::unistd::Pid;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::session::{LifecycleState, SessionInfo};
use crate::storage::Storage;

/// Checks whether a process with the given PID is alive, matching the
/// teacher's `nix::sys::signal::kill(pid, None)` liveness probe.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    signal::kill(Pid::from_raw(pid_i32), None).is_ok()
}

/// The registry is the single writer for `SessionInfo`; readers can be
/// concurrent (spec.md §5).
pub struct SessionRegistry {
    sessions: RwLock<IndexMap<String, SessionInfo>>,
    storage: Arc<dyn Storage>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(storage: Arc<dyn Storage>, max_sessions: usize) -> Self {
        Self { sessions: RwLock::new(IndexMap::new()), storage, max_sessions }
    }

    /// Idempotent create. Enforces the max-concurrent-sessions ceiling
    /// (spec.md §4.4) for genuinely new registrations.
    pub async fn register(&self, info: SessionInfo) -> BrokerResult<()> {
        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(&info.id) && sessions.len() >= self.max_sessions {
            return Err(BrokerError::SessionLimitReached(self.max_sessions));
        }
        let _ = self.storage.save_launcher(&info).await;
        sessions.insert(info.id.clone(), info);
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn get_starting_sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.lifecycle_state == LifecycleState::Starting)
            .cloned()
            .collect()
    }

    async fn mutate<F>(&self, id: &str, f: F) -> BrokerResult<()>
    where
        F: FnOnce(&mut SessionInfo),
    {
        let mut sessions = self.sessions.write().await;
        let info = sessions.get_mut(id).ok_or_else(|| BrokerError::SessionNotFound(id.to_owned()))?;
        f(info);
        let _ = self.storage.save_launcher(info).await;
        Ok(())
    }

    pub async fn set_backend_session_id(&self, id: &str, vendor_id: String) -> BrokerResult<()> {
        self.mutate(id, |info| info.backend_session_id = Some(vendor_id)).await
    }

    pub async fn set_pid(&self, id: &str, pid: u32) -> BrokerResult<()> {
        self.mutate(id, |info| info.pid = Some(pid)).await
    }

    pub async fn mark_connected(&self, id: &str) -> BrokerResult<()> {
        self.mutate(id, |info| info.lifecycle_state = LifecycleState::Connected).await
    }

    pub async fn mark_exited(&self, id: &str, exit_code: Option<i32>) -> BrokerResult<()> {
        self.mutate(id, |info| {
            info.lifecycle_state = LifecycleState::Exited;
            info.exit_code = exit_code;
        })
        .await
    }

    pub async fn set_archived(&self, id: &str, archived: bool) -> BrokerResult<()> {
        self.mutate(id, |info| info.archived = archived).await?;
        let _ = self.storage.set_session_archived(id, archived).await;
        Ok(())
    }

    pub async fn set_session_name(&self, id: &str, name: String) -> BrokerResult<()> {
        self.mutate(id, |info| info.name = Some(name)).await
    }

    /// On startup, load persisted `SessionInfo`; for each entry with a live
    /// pid and a non-exited state, probe liveness. Live processes resume as
    /// `starting` (the backend must reconnect); dead ones are marked
    /// `exited` with `exitCode = -1` (spec.md §4.4).
    pub async fn restore_from_storage(&self) -> BrokerResult<()> {
        let persisted = self.storage.load_all_launcher().await.map_err(|e| {
            BrokerError::Storage(format!("failed to load launcher bucket: {e}"))
        })?;

        let mut sessions = self.sessions.write().await;
        for mut info in persisted {
            if let Some(pid) = info.pid {
                if info.lifecycle_state != LifecycleState::Exited {
                    if is_process_alive(pid) {
                        info.lifecycle_state = LifecycleState::Starting;
                        debug!(session_id = %info.id, pid, "restored session: process alive");
                    } else {
                        info.lifecycle_state = LifecycleState::Exited;
                        info.exit_code = Some(-1);
                        warn!(session_id = %info.id, pid, "restored session: process dead");
                    }
                }
            }
            sessions.insert(info.id.clone(), info);
        }
        Ok(())
    }

    /// Drop all entries with state `exited`.
    pub async fn prune_exited(&self) {
        let mut sessions = self.sessions.write().await;
        let exited: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.lifecycle_state == LifecycleState::Exited)
            .map(|(id, _)| id.clone())
            .collect();
        for id in exited {
            sessions.shift_remove(&id);
            let _ = self.storage.remove_launcher(&id).await;
        }
    }

    pub async fn remove_session(&self, id: &str) -> BrokerResult<()> {
        let mut sessions = self.sessions.write().await;
        sessions
            .shift_remove(id)
            .ok_or_else(|| BrokerError::SessionNotFound(id.to_owned()))?;
        let _ = self.storage.remove_launcher(id).await;
        Ok(())
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
