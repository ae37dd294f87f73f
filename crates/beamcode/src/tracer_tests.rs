// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;
use crate::message::Role;

fn enabled_config() -> TracerConfig {
    TracerConfig { enabled: true, full: true, allow_sensitive: false, prometheus_enabled: true }
}

#[test]
fn render_is_none_when_prometheus_is_disabled() {
    let tracer = Tracer::new(TracerConfig { prometheus_enabled: false, ..enabled_config() });
    assert!(tracer.render().is_none());
}

#[test]
fn on_message_increments_the_messages_total_counter() {
    let tracer = Tracer::new(enabled_config());
    let msg = UnifiedMessage::new(MessageType::UserMessage, Role::User);
    tracer.on_message(Edge::ConsumerToCoordinator, &msg);

    let rendered = tracer.render().expect("prometheus enabled");
    assert!(rendered.contains("beamcode_messages_total"));
    assert!(rendered.contains("consumer_to_coordinator"));
}

#[test]
fn breaker_state_and_gauges_round_trip_into_rendered_output() {
    let tracer = Tracer::new(enabled_config());
    tracer.set_active_sessions(3);
    tracer.set_active_consumers(7);
    tracer.set_breaker_state("sess-1", BreakerState::Open);
    tracer.observe_permission_round_trip(Duration::from_millis(250));

    let rendered = tracer.render().expect("prometheus enabled");
    assert!(rendered.contains("beamcode_active_sessions 3"));
    assert!(rendered.contains("beamcode_active_consumers 7"));
    assert!(rendered.contains("beamcode_circuit_breaker_state"));
    assert!(rendered.contains("beamcode_permission_round_trip_seconds"));
}

#[test]
fn disabled_tracer_never_panics_on_any_call() {
    let tracer = Tracer::new(TracerConfig { enabled: false, full: false, allow_sensitive: false, prometheus_enabled: false });
    let msg = UnifiedMessage::new(MessageType::Error, Role::System);
    tracer.on_message(Edge::BackendToConsumer, &msg);
    tracer.set_active_sessions(0);
    tracer.set_breaker_state("sess-2", BreakerState::Closed);
    assert!(tracer.render().is_none());
}
