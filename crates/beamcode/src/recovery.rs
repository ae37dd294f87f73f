// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Recovery Service (spec.md §4.10) — watches the domain event bus for
//! signs that a backend connection is gone without the session having been
//! deleted, and relaunches or reconnects it. Dedups concurrent recovery
//! attempts per session and defers to the circuit breaker so a crash-looping
//! backend eventually stops being retried.
//!
//! Grounded on the teacher's background health-checker
//! (`upstream/health.rs`): a `tokio::spawn`ed loop selecting between a
//! cancellation token and bus events, reacting to state it reads through a
//! narrow accessor rather than owning the state itself.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{DomainEvent, EventBus};
use crate::coordinator::SessionCoordinator;
use crate::session::LifecycleState;

/// Tunables for the relaunch/reconnect cadence (spec.md §4.10).
#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    /// Minimum spacing between two recovery attempts for the same session,
    /// so a burst of `ProcessExited`/`RelaunchNeeded` events doesn't trigger
    /// overlapping relaunches.
    pub relaunch_dedup: Duration,
    /// SIGTERM→spawn grace period for the inverted-connection path.
    pub relaunch_grace_period: Duration,
    /// How soon after a `--resume` relaunch a process must stay up for the
    /// resume to be considered successful.
    pub resume_failure_threshold: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            relaunch_dedup: Duration::from_secs(3),
            relaunch_grace_period: Duration::from_secs(5),
            resume_failure_threshold: Duration::from_secs(5),
        }
    }
}

pub struct RecoveryService {
    bus: EventBus,
    coordinator: Weak<SessionCoordinator>,
    config: RecoveryConfig,
    relaunching: Arc<Mutex<HashSet<String>>>,
}

impl RecoveryService {
    pub fn new(bus: EventBus, coordinator: Weak<SessionCoordinator>, config: RecoveryConfig) -> Arc<Self> {
        Arc::new(Self { bus, coordinator, config, relaunching: Arc::new(Mutex::new(HashSet::new())) })
    }

    /// Start the watch loop. Cancellation-safe: exits cleanly once `cancel`
    /// fires or the bus is closed.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => {
                        match event {
                            Ok(DomainEvent::RelaunchNeeded { session_id }) => self.maybe_recover(&session_id).await,
                            Ok(DomainEvent::ProcessExited { session_id, .. }) => {
                                // A process exiting without a deliberate
                                // delete is the inverted-connection analogue
                                // of `RelaunchNeeded`: the backend died, the
                                // session wasn't removed.
                                self.maybe_recover(&session_id).await;
                            }
                            Ok(_) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        });
    }

    /// `maybeRecover` (spec.md §4.10 pseudocode): branch on inverted vs.
    /// direct-connect, dedup, and consult the coordinator's snapshot before
    /// ever attempting a relaunch.
    async fn maybe_recover(&self, session_id: &str) {
        let Some(coordinator) = self.coordinator.upgrade() else { return };
        let Some(snapshot) = coordinator.recovery_snapshot(session_id).await else { return };

        if snapshot.archived || snapshot.lifecycle_state == LifecycleState::Exited {
            return;
        }

        {
            let mut relaunching = self.relaunching.lock().await;
            if relaunching.contains(session_id) {
                return;
            }
            relaunching.insert(session_id.to_owned());
        }

        let id = session_id.to_owned();
        let dedup = self.config.relaunch_dedup;

        if snapshot.pid.is_some() {
            // Inverted-connection (launcher-owned): still mid-handshake,
            // skip regardless of `has_backend` — that flag only flips true
            // once the handshake finishes, so it's false for the entire
            // window this check exists to protect (spec.md §4.10).
            if is_still_connecting(snapshot.lifecycle_state) {
                self.unmark_after(id, dedup);
                return;
            }
            let grace = self.config.relaunch_grace_period;
            let threshold = self.config.resume_failure_threshold;
            match coordinator.relaunch(&id, grace, threshold).await {
                Ok(()) => debug!(session_id = %id, "recovery: relaunched"),
                Err(e) => warn!(session_id = %id, err = %e, "recovery: relaunch failed"),
            }
        } else {
            if snapshot.has_backend {
                self.unmark_after(id, dedup);
                return;
            }
            match coordinator.reconnect(&id).await {
                Ok(()) => debug!(session_id = %id, "recovery: reconnected"),
                Err(e) => warn!(session_id = %id, err = %e, "recovery: reconnect failed"),
            }
        }

        self.unmark_after(id, dedup);
    }

    fn unmark_after(&self, session_id: String, delay: Duration) {
        let relaunching = Arc::clone(&self.relaunching);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            relaunching.lock().await.remove(&session_id);
        });
    }
}

/// An inverted-connection session is still mid-handshake whenever its
/// lifecycle state is `starting`, full stop (spec.md §4.10) — `has_backend`
/// only becomes true once that handshake completes, so it can never be used
/// to narrow this check.
fn is_still_connecting(lifecycle_state: LifecycleState) -> bool {
    lifecycle_state == LifecycleState::Starting
}

#[cfg(test)]
#[path = "recovery_tests.rs"]
mod tests;
