// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Message Tracer / Metrics (SPEC_FULL.md §4.12) — best-effort Prometheus
//! instrumentation tapping `UnifiedMessage` traffic at the edges named in
//! spec.md §2's data-flow diagram. Never on the critical path for
//! correctness: every increment is infallible, and a misconfigured registry
//! only loses metrics, never blocks a send.

use std::time::Duration;

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::debug;

use crate::circuit::BreakerState;
use crate::message::{MessageType, UnifiedMessage};

/// Which direction a tapped frame crossed a component boundary, matching
/// spec.md §2's three labelled edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    ConsumerToCoordinator,
    CoordinatorToBackend,
    BackendToConsumer,
}

impl Edge {
    fn as_str(self) -> &'static str {
        match self {
            Self::ConsumerToCoordinator => "consumer_to_coordinator",
            Self::CoordinatorToBackend => "coordinator_to_backend",
            Self::BackendToConsumer => "backend_to_consumer",
        }
    }
}

fn message_type_label(t: MessageType) -> &'static str {
    match t {
        MessageType::SessionInit => "session_init",
        MessageType::StatusChange => "status_change",
        MessageType::Result => "result",
        MessageType::Assistant => "assistant",
        MessageType::UserMessage => "user_message",
        MessageType::StreamEvent => "stream_event",
        MessageType::ToolProgress => "tool_progress",
        MessageType::ToolUseSummary => "tool_use_summary",
        MessageType::PermissionRequest => "permission_request",
        MessageType::PermissionResponse => "permission_response",
        MessageType::PermissionCancelled => "permission_cancelled",
        MessageType::Interrupt => "interrupt",
        MessageType::ControlRequest => "control_request",
        MessageType::ControlResponse => "control_response",
        MessageType::AuthStatus => "auth_status",
        MessageType::SlashCommandResult => "slash_command_result",
        MessageType::SlashCommandError => "slash_command_error",
        MessageType::CliConnected => "cli_connected",
        MessageType::CliDisconnected => "cli_disconnected",
        MessageType::Error => "error",
    }
}

/// Runtime knobs, mirrored from `Config` (spec.md §6 `BEAMCODE_TRACE*`).
#[derive(Debug, Clone, Copy)]
pub struct TracerConfig {
    pub enabled: bool,
    pub full: bool,
    pub allow_sensitive: bool,
    pub prometheus_enabled: bool,
}

impl TracerConfig {
    pub fn from_env_values(trace: bool, trace_level: &str, allow_sensitive: bool, prometheus: bool) -> Self {
        Self { enabled: trace, full: trace_level == "full", allow_sensitive, prometheus_enabled: prometheus }
    }
}

struct Metrics {
    registry: Registry,
    messages_total: IntCounterVec,
    permission_latency: Histogram,
    active_sessions: IntGauge,
    active_consumers: IntGauge,
    breaker_state: IntGaugeVec,
}

impl Metrics {
    fn new() -> Option<Self> {
        let registry = Registry::new();

        let messages_total = IntCounterVec::new(
            Opts::new("beamcode_messages_total", "UnifiedMessage frames tapped, by edge and message type"),
            &["edge", "message_type"],
        )
        .ok()?;
        let permission_latency = Histogram::with_opts(HistogramOpts::new(
            "beamcode_permission_round_trip_seconds",
            "Time between a permission_request being observed and its permission_response being forwarded back",
        ))
        .ok()?;
        let active_sessions = IntGauge::new("beamcode_active_sessions", "Sessions currently tracked by the coordinator").ok()?;
        let active_consumers = IntGauge::new("beamcode_active_consumers", "Consumer WebSocket connections currently attached").ok()?;
        let breaker_state = IntGaugeVec::new(
            Opts::new("beamcode_circuit_breaker_state", "Circuit breaker state per session (0=closed, 1=half_open, 2=open)"),
            &["session_id"],
        )
        .ok()?;

        registry.register(Box::new(messages_total.clone())).ok()?;
        registry.register(Box::new(permission_latency.clone())).ok()?;
        registry.register(Box::new(active_sessions.clone())).ok()?;
        registry.register(Box::new(active_consumers.clone())).ok()?;
        registry.register(Box::new(breaker_state.clone())).ok()?;

        Some(Self { registry, messages_total, permission_latency, active_sessions, active_consumers, breaker_state })
    }
}

/// Best-effort tap, wired in at every point a `UnifiedMessage` crosses a
/// named edge (spec.md §2). Constructing one never fails: a `Metrics` setup
/// failure just leaves `/metrics` empty rather than aborting startup.
pub struct Tracer {
    config: TracerConfig,
    metrics: Option<Metrics>,
}

impl Tracer {
    pub fn new(config: TracerConfig) -> Self {
        let metrics = if config.prometheus_enabled {
            match Metrics::new() {
                Some(m) => Some(m),
                None => {
                    debug!("tracer: failed to construct prometheus registry, /metrics will be empty");
                    None
                }
            }
        } else {
            None
        };
        Self { config, metrics }
    }

    /// Tap a frame crossing `edge`. Swallows every failure at `debug` —
    /// never interrupts the send path it's instrumenting.
    pub fn on_message(&self, edge: Edge, msg: &UnifiedMessage) {
        if let Some(metrics) = &self.metrics {
            metrics.messages_total.with_label_values(&[edge.as_str(), message_type_label(msg.message_type)]).inc();
        }

        if !self.config.enabled {
            return;
        }
        if self.config.full {
            if self.config.allow_sensitive {
                debug!(edge = edge.as_str(), message_type = ?msg.message_type, content = ?msg.content, "traced message");
            } else {
                debug!(edge = edge.as_str(), message_type = ?msg.message_type, "traced message (content redacted)");
            }
        } else {
            debug!(edge = edge.as_str(), message_type = ?msg.message_type, "traced message");
        }
    }

    pub fn observe_permission_round_trip(&self, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.permission_latency.observe(elapsed.as_secs_f64());
        }
    }

    pub fn set_active_sessions(&self, count: i64) {
        if let Some(metrics) = &self.metrics {
            metrics.active_sessions.set(count);
        }
    }

    pub fn set_active_consumers(&self, count: i64) {
        if let Some(metrics) = &self.metrics {
            metrics.active_consumers.set(count);
        }
    }

    pub fn set_breaker_state(&self, session_id: &str, state: BreakerState) {
        if let Some(metrics) = &self.metrics {
            let value = match state {
                BreakerState::Closed => 0,
                BreakerState::HalfOpen => 1,
                BreakerState::Open => 2,
            };
            metrics.breaker_state.with_label_values(&[session_id]).set(value);
        }
    }

    /// Render the Prometheus text exposition format for the `/metrics`
    /// HTTP route. Returns `None` when `BEAMCODE_PROMETHEUS` is unset, so
    /// the facade can answer 404 instead of an empty body.
    pub fn render(&self) -> Option<String> {
        let metrics = self.metrics.as_ref()?;
        let families = metrics.registry.gather();
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&families, &mut buf) {
            debug!(err = %e, "tracer: failed to encode metrics");
            return None;
        }
        String::from_utf8(buf).ok()
    }
}

#[cfg(test)]
#[path = "tracer_tests.rs"]
mod tests;
