// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;
use crate::message::{ContentBlock, MessageType, Role};

#[test]
fn best_effort_decode_parses_unified_message_wire_shape() {
    let msg = UnifiedMessage::new(MessageType::Assistant, Role::Assistant)
        .with_content(vec![ContentBlock::Text { text: "hi".into() }]);
    let wire = serde_json::to_string(&msg).unwrap();
    let decoded = best_effort_decode(&wire);
    assert_eq!(decoded.message_type, MessageType::Assistant);
}

#[test]
fn best_effort_decode_wraps_opaque_text_as_assistant_message() {
    let decoded = best_effort_decode("not json at all");
    assert_eq!(decoded.message_type, MessageType::Assistant);
    assert_eq!(decoded.content.len(), 1);
}

#[test]
fn encode_outbound_round_trips_through_best_effort_decode() {
    let msg = UnifiedMessage::new(MessageType::UserMessage, Role::User)
        .with_content(vec![ContentBlock::Text { text: "go".into() }]);
    let wire = encode_outbound(&msg).unwrap();
    let decoded = best_effort_decode(&wire);
    assert_eq!(decoded.message_type, MessageType::UserMessage);
}

#[tokio::test]
async fn inverted_registry_cancel_drops_reservation_without_a_live_socket() {
    // axum::extract::ws::WebSocket can only be constructed from a real
    // upgrade, so claim() itself isn't exercised in a unit test — this
    // covers the reserve/cancel bookkeeping the adapter relies on for its
    // connect-timeout path.
    let registry = InvertedRegistry::new();
    let rx = registry.reserve("sess-1").await;
    registry.cancel("sess-1").await;
    drop(rx);
}
