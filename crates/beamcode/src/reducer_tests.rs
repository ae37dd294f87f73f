// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use serde_json::json;

use super::*;
use crate::message::Role;
use crate::session::state::SessionState;

fn fresh_state() -> Arc<SessionState> {
    Arc::new(SessionState::new("s1".into()))
}

#[test]
fn reduce_returns_same_arc_when_message_carries_no_relevant_metadata() {
    let state = fresh_state();
    let msg = UnifiedMessage::new(MessageType::Assistant, Role::Assistant);
    let next = reduce(&state, &msg);
    assert!(Arc::ptr_eq(&state, &next));
}

#[test]
fn session_init_merges_model_and_tools() {
    let state = fresh_state();
    let msg = UnifiedMessage::new(MessageType::SessionInit, Role::System)
        .with_metadata("model", "claude-sonnet")
        .with_metadata("cwd", "/workspace")
        .with_metadata("tools", json!(["Bash", "Edit"]));

    let next = reduce(&state, &msg);
    assert!(!Arc::ptr_eq(&state, &next));
    assert_eq!(next.model.as_deref(), Some("claude-sonnet"));
    assert_eq!(next.cwd.as_deref(), Some("/workspace"));
    assert_eq!(next.tools, vec!["Bash".to_owned(), "Edit".to_owned()]);
}

#[test]
fn session_init_with_no_recognized_fields_is_a_no_op() {
    let state = fresh_state();
    let msg = UnifiedMessage::new(MessageType::SessionInit, Role::System);
    let next = reduce(&state, &msg);
    assert!(Arc::ptr_eq(&state, &next));
}

#[test]
fn result_computes_context_used_percent_from_model_usage() {
    let state = fresh_state();
    let msg = UnifiedMessage::new(MessageType::Result, Role::System).with_metadata(
        "modelUsage",
        json!({
            "claude-sonnet": {
                "inputTokens": 50_000,
                "outputTokens": 10_000,
                "contextWindow": 200_000,
                "costUSD": 0.42,
            }
        }),
    );

    let next = reduce(&state, &msg);
    assert!((next.context_used_percent - 30.0).abs() < f64::EPSILON);
    let usage = next.last_model_usage.as_ref().unwrap().get("claude-sonnet").unwrap();
    assert_eq!(usage.input_tokens, 50_000);
    assert_eq!(usage.output_tokens, 10_000);
}

#[test]
fn result_context_used_percent_uses_wire_arrival_order_not_alphabetical() {
    let state = fresh_state();
    // "zeta-model" arrives first on the wire but sorts after "alpha-model"
    // alphabetically; the reducer must pick the first key as written, which
    // only holds if `serde_json::Map` preserves insertion order (spec.md
    // §4.8/§8(b) "first model").
    let msg = UnifiedMessage::new(MessageType::Result, Role::System).with_metadata(
        "modelUsage",
        json!({
            "zeta-model": {
                "inputTokens": 1_000,
                "outputTokens": 1_000,
                "contextWindow": 10_000,
                "costUSD": 0.01,
            },
            "alpha-model": {
                "inputTokens": 50_000,
                "outputTokens": 50_000,
                "contextWindow": 1_000_000,
                "costUSD": 9.0,
            },
        }),
    );

    let next = reduce(&state, &msg);
    // zeta-model: (1000 + 1000) / 10000 * 100 = 20
    assert!((next.context_used_percent - 20.0).abs() < f64::EPSILON);
}

#[test]
fn result_merges_cost_and_turn_counters() {
    let state = fresh_state();
    let msg = UnifiedMessage::new(MessageType::Result, Role::System)
        .with_metadata("total_cost_usd", 1.5)
        .with_metadata("num_turns", 3);

    let next = reduce(&state, &msg);
    assert_eq!(next.total_cost_usd, 1.5);
    assert_eq!(next.num_turns, 3);
}

#[test]
fn status_change_tracks_compacting_flag() {
    let state = fresh_state();
    let msg = UnifiedMessage::new(MessageType::StatusChange, Role::System).with_metadata("status", "compacting");
    let next = reduce(&state, &msg);
    assert!(!Arc::ptr_eq(&state, &next));
    assert!(next.is_compacting);

    let msg = UnifiedMessage::new(MessageType::StatusChange, Role::System).with_metadata("status", "idle");
    let settled = reduce(&next, &msg);
    assert!(!settled.is_compacting);
}

#[test]
fn control_response_never_mutates_state() {
    let state = fresh_state();
    let msg = UnifiedMessage::new(MessageType::ControlResponse, Role::System).with_metadata("subtype", "can_use_tool");
    let next = reduce(&state, &msg);
    assert!(Arc::ptr_eq(&state, &next));
}

#[test]
fn is_team_tool_recognizes_fixed_toolset_and_scoped_task_spawn() {
    assert!(is_team_tool("TeamCreate", &json!({})));
    assert!(is_team_tool("SendMessage", &json!({})));
    assert!(!is_team_tool("Bash", &json!({"command": "ls"})));
    assert!(is_team_tool("Task", &json!({"team_name": "t1", "name": "worker"})));
    assert!(!is_team_tool("Task", &json!({"name": "worker"})));
}

#[test]
fn team_create_applies_optimistically_on_tool_use() {
    let state = fresh_state();
    let mut buffer = IndexMap::new();
    let msg = UnifiedMessage::new(MessageType::Assistant, Role::Assistant).with_content(vec![ContentBlock::ToolUse {
        id: "tu-1".into(),
        name: "TeamCreate".into(),
        input: json!({"name": "alpha", "members": ["researcher", "writer"]}),
    }]);

    let next = apply(&state, &mut buffer, &msg);
    let team = next.team.as_ref().unwrap();
    assert_eq!(team.name.as_deref(), Some("alpha"));
    assert_eq!(team.members.len(), 2);
    assert!(buffer.contains_key("tu-1"));
}

#[test]
fn task_create_then_tool_result_reconciles_synthetic_id() {
    let state = fresh_state();
    let mut buffer = IndexMap::new();

    let use_msg = UnifiedMessage::new(MessageType::Assistant, Role::Assistant).with_content(vec![ContentBlock::ToolUse {
        id: "tu-42".into(),
        name: "TaskCreate".into(),
        input: json!({"name": "write docs"}),
    }]);
    let state = apply(&state, &mut buffer, &use_msg);
    let team = state.team.as_ref().unwrap();
    assert_eq!(team.tasks[0].id, "tu-tu-42");

    let result_msg = UnifiedMessage::new(MessageType::Assistant, Role::Tool).with_content(vec![ContentBlock::ToolResult {
        tool_use_id: "tu-42".into(),
        content: json!({"id": "task-real-id"}),
        is_error: false,
    }]);
    let state = apply(&state, &mut buffer, &result_msg);
    let team = state.team.as_ref().unwrap();
    assert_eq!(team.tasks[0].id, "task-real-id");
    assert!(!buffer.contains_key("tu-42"));
}

#[test]
fn errored_tool_result_does_not_apply_confirmed_mutation() {
    let state = fresh_state();
    let mut buffer = IndexMap::new();
    let use_msg = UnifiedMessage::new(MessageType::Assistant, Role::Assistant).with_content(vec![ContentBlock::ToolUse {
        id: "tu-9".into(),
        name: "TeamDelete".into(),
        input: json!({}),
    }]);
    let state = apply(&state, &mut buffer, &use_msg);

    let result_msg = UnifiedMessage::new(MessageType::Assistant, Role::Tool).with_content(vec![ContentBlock::ToolResult {
        tool_use_id: "tu-9".into(),
        content: json!({}),
        is_error: true,
    }]);
    let state = apply(&state, &mut buffer, &result_msg);
    // No team was ever created, so TeamDelete failing is a no-op either way,
    // but the key assertion is that the buffered entry is still consumed.
    assert!(!buffer.contains_key("tu-9"));
    assert!(state.team.is_none());
}

#[test]
fn flush_team_buffer_evicts_entries_past_ttl() {
    let mut buffer = IndexMap::new();
    buffer.insert(
        "stale".to_owned(),
        BufferedToolUse {
            tool_name: "TaskCreate".into(),
            input: json!({}),
            inserted_at: Instant::now() - TEAM_BUFFER_TTL - Duration::from_secs(1),
        },
    );
    buffer.insert(
        "fresh".to_owned(),
        BufferedToolUse { tool_name: "TaskCreate".into(), input: json!({}), inserted_at: Instant::now() },
    );

    flush_team_buffer(&mut buffer);
    assert!(!buffer.contains_key("stale"));
    assert!(buffer.contains_key("fresh"));
}
