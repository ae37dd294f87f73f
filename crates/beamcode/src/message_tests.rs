// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;

#[test]
fn ids_are_unique_and_never_reused() {
    let a = UnifiedMessage::new(MessageType::UserMessage, Role::User);
    let b = UnifiedMessage::new(MessageType::UserMessage, Role::User);
    assert_ne!(a.id, b.id);
}

#[test]
fn synthetic_error_carries_code_in_metadata() {
    let msg = UnifiedMessage::synthetic_error("observers cannot send", ErrorCode::Unknown);
    assert_eq!(msg.message_type, MessageType::Error);
    assert_eq!(msg.meta_str("error_code"), Some("unknown"));
}

#[test]
fn serializes_with_internally_tagged_content_blocks() {
    let msg = UnifiedMessage::new(MessageType::Assistant, Role::Assistant)
        .with_content(vec![ContentBlock::Text { text: "hi".into() }]);
    let json = serde_json::to_value(&msg).unwrap();
    assert_eq!(json["type"], "assistant");
    assert_eq!(json["content"][0]["type"], "text");
    assert_eq!(json["content"][0]["text"], "hi");
}

#[test]
fn round_trips_tool_use_and_tool_result_blocks() {
    let blocks = vec![
        ContentBlock::ToolUse {
            id: "tu1".into(),
            name: "Bash".into(),
            input: serde_json::json!({"command": "ls"}),
        },
        ContentBlock::ToolResult {
            tool_use_id: "tu1".into(),
            content: serde_json::json!("ok"),
            is_error: false,
        },
    ];
    let msg =
        UnifiedMessage::new(MessageType::Assistant, Role::Assistant).with_content(blocks.clone());
    let json = serde_json::to_string(&msg).unwrap();
    let back: UnifiedMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(back.content, blocks);
}
