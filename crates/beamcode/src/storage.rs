// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Opaque persisted-state façade (spec.md §6). Two buckets per data
//! directory: a session bucket holding message history / pending state,
//! and a launcher bucket holding `SessionInfo`. Storage *format* is out of
//! scope per spec.md §1 — this is a minimal JSON-file-per-entry backend,
//! the simplest concrete instance of the `save/load/loadAll/remove` façade
//! the registry depends on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::message::UnifiedMessage;
use crate::session::SessionInfo;

/// Persisted snapshot of a session's backend-facing state (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub id: String,
    pub state: crate::session::SessionState,
    pub message_history: Vec<UnifiedMessage>,
    pub pending_messages: Vec<UnifiedMessage>,
    #[serde(default)]
    pub pending_permission_ids: Vec<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub name: Option<String>,
}

/// Storage abstraction injected into the Session Registry (spec.md §4.4:
/// "Writes are best-effort through an injected storage abstraction").
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    async fn save_session(&self, entry: &PersistedSession) -> anyhow::Result<()>;
    async fn load_session(&self, id: &str) -> anyhow::Result<Option<PersistedSession>>;
    async fn load_all_sessions(&self) -> anyhow::Result<Vec<PersistedSession>>;
    async fn remove_session(&self, id: &str) -> anyhow::Result<()>;
    async fn set_session_archived(&self, id: &str, archived: bool) -> anyhow::Result<()>;

    async fn save_launcher(&self, info: &SessionInfo) -> anyhow::Result<()>;
    async fn load_all_launcher(&self) -> anyhow::Result<Vec<SessionInfo>>;
    async fn remove_launcher(&self, id: &str) -> anyhow::Result<()>;
}

/// A JSON-file-per-entry backend rooted at a data directory. Corruption on
/// read is non-fatal: load what parses, discard the rest, log (spec.md
/// §6).
pub struct FileStorage {
    root: PathBuf,
    // Guards against concurrent writers racing on the same file; the
    // registry is still the single logical writer (spec.md §5).
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), lock: Mutex::new(()) }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    fn launcher_dir(&self) -> PathBuf {
        self.root.join("launcher")
    }

    async fn ensure_dirs(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(self.sessions_dir()).await?;
        tokio::fs::create_dir_all(self.launcher_dir()).await?;
        Ok(())
    }

    fn entry_path(dir: &Path, id: &str) -> PathBuf {
        dir.join(format!("{id}.json"))
    }

    async fn load_dir<T: for<'de> Deserialize<'de>>(dir: &Path) -> Vec<T> {
        let mut out = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            return out;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                    Ok(value) => out.push(value),
                    Err(e) => warn!(path = %path.display(), err = %e, "discarding corrupt entry"),
                },
                Err(e) => warn!(path = %path.display(), err = %e, "failed to read entry"),
            }
        }
        out
    }
}

#[async_trait::async_trait]
impl Storage for FileStorage {
    async fn save_session(&self, entry: &PersistedSession) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        self.ensure_dirs().await?;
        let path = Self::entry_path(&self.sessions_dir(), &entry.id);
        let bytes = serde_json::to_vec_pretty(entry)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn load_session(&self, id: &str) -> anyhow::Result<Option<PersistedSession>> {
        let path = Self::entry_path(&self.sessions_dir(), id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(_) => Ok(None),
        }
    }

    async fn load_all_sessions(&self) -> anyhow::Result<Vec<PersistedSession>> {
        Ok(Self::load_dir(&self.sessions_dir()).await)
    }

    async fn remove_session(&self, id: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = Self::entry_path(&self.sessions_dir(), id);
        let _ = tokio::fs::remove_file(path).await;
        Ok(())
    }

    async fn set_session_archived(&self, id: &str, archived: bool) -> anyhow::Result<()> {
        if let Some(mut entry) = self.load_session(id).await? {
            entry.archived = archived;
            self.save_session(&entry).await?;
        }
        Ok(())
    }

    async fn save_launcher(&self, info: &SessionInfo) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        self.ensure_dirs().await?;
        let path = Self::entry_path(&self.launcher_dir(), &info.id);
        let bytes = serde_json::to_vec_pretty(info)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn load_all_launcher(&self) -> anyhow::Result<Vec<SessionInfo>> {
        Ok(Self::load_dir(&self.launcher_dir()).await)
    }

    async fn remove_launcher(&self, id: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = Self::entry_path(&self.launcher_dir(), id);
        let _ = tokio::fs::remove_file(path).await;
        Ok(())
    }
}

/// In-memory storage, used in tests and as a building block for
/// `FileStorage`-free unit coverage of the registry.
#[derive(Default)]
pub struct MemoryStorage {
    sessions: Mutex<HashMap<String, PersistedSession>>,
    launcher: Mutex<HashMap<String, SessionInfo>>,
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn save_session(&self, entry: &PersistedSession) -> anyhow::Result<()> {
        self.sessions.lock().await.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn load_session(&self, id: &str) -> anyhow::Result<Option<PersistedSession>> {
        Ok(self.sessions.lock().await.get(id).cloned())
    }

    async fn load_all_sessions(&self) -> anyhow::Result<Vec<PersistedSession>> {
        Ok(self.sessions.lock().await.values().cloned().collect())
    }

    async fn remove_session(&self, id: &str) -> anyhow::Result<()> {
        self.sessions.lock().await.remove(id);
        Ok(())
    }

    async fn set_session_archived(&self, id: &str, archived: bool) -> anyhow::Result<()> {
        if let Some(entry) = self.sessions.lock().await.get_mut(id) {
            entry.archived = archived;
        }
        Ok(())
    }

    async fn save_launcher(&self, info: &SessionInfo) -> anyhow::Result<()> {
        self.launcher.lock().await.insert(info.id.clone(), info.clone());
        Ok(())
    }

    async fn load_all_launcher(&self) -> anyhow::Result<Vec<SessionInfo>> {
        Ok(self.launcher.lock().await.values().cloned().collect())
    }

    async fn remove_launcher(&self, id: &str) -> anyhow::Result<()> {
        self.launcher.lock().await.remove(id);
        Ok(())
    }
}

#[cfg(test)]
#[path = "storage_tests.rs"]
mod tests;
