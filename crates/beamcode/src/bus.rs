// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The domain event bus (spec.md §9: "a small in-process message bus with
//! topic types enumerated as a closed sum"). A dedicated relay forwards
//! bridge and launcher events here; `message:inbound` is deliberately
//! excluded because it is a command, not a domain event (spec.md §4.9).

use tokio::sync::broadcast;

use crate::circuit::BreakerSnapshot;
use crate::message::UnifiedMessage;

/// Closed set of domain events forwarded onto the bus.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    ProcessSpawned { session_id: String, pid: u32 },
    ProcessStdout { session_id: String, line: String },
    ProcessStderr { session_id: String, line: String },
    /// `circuit_breaker` mirrors spec.md §4.2's `process:exited{...,
    /// circuitBreaker?}`: present only when the breaker isn't `closed`.
    ProcessExited { session_id: String, exit_code: Option<i32>, uptime_ms: u64, circuit_breaker: Option<BreakerSnapshot> },
    BackendConnected { session_id: String },
    BackendDisconnected { session_id: String },
    CliConnected { session_id: String },
    CliDisconnected { session_id: String },
    ConsumerConnected { session_id: String, connection_id: String },
    ConsumerDisconnected { session_id: String, connection_id: String },
    PermissionResolved { session_id: String, request_id: String },
    RelaunchNeeded { session_id: String },
    ResumeFailed { session_id: String },
    Unified { session_id: String, message: UnifiedMessage },
}

/// Process-wide event bus. Cloning is cheap — it is a handle to the
/// underlying broadcast channel, mirroring the teacher's `broadcast::Sender`
/// fields on its aggregator hub.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Best-effort: if there are no subscribers this is a
    /// silent no-op, matching `broadcast::Sender::send`'s semantics.
    pub fn publish(&self, event: DomainEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
