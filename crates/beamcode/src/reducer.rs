// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State Reducer (spec.md §4.8) — the pure `reduce(state, msg) -> state`
//! function plus the team-tool correlation pre-stage. `Session::state` is
//! `Arc<SessionState>`; a message that changes nothing returns the same
//! `Arc` (checkable with `Arc::ptr_eq`), matching the "referential
//! discipline" invariant in spec.md §8 #1.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde_json::Value;

use crate::message::{ContentBlock, MessageType, UnifiedMessage};
use crate::session::state::{ModelUsage, SessionState, TeamState, TeamTask};

/// Team tool names recognized verbatim (spec.md §4.8); `Task` is
/// recognized separately, only when it carries both `team_name` and
/// `name` as non-empty strings (a team-scoped task spawn).
pub const TEAM_TOOL_NAMES: &[&str] =
    &["TeamCreate", "TeamDelete", "TaskCreate", "TaskUpdate", "TaskList", "TaskGet", "SendMessage"];

/// How long a buffered tool_use waits for its matching tool_result before
/// the pre-stage's `flush` drops it (spec.md §4.8, §5).
pub const TEAM_BUFFER_TTL: Duration = Duration::from_secs(30);

/// A team-tool `tool_use` awaiting its `tool_result`, keyed by
/// `tool_use_id` in `Session::team_buffer`.
#[derive(Debug, Clone)]
pub struct BufferedToolUse {
    pub tool_name: String,
    pub input: Value,
    pub inserted_at: Instant,
}

fn non_empty_str(input: &Value, key: &str) -> Option<&str> {
    input.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Whether a `tool_use` block participates in team-tool correlation
/// (spec.md §4.8).
pub fn is_team_tool(name: &str, input: &Value) -> bool {
    if TEAM_TOOL_NAMES.contains(&name) {
        return true;
    }
    name == "Task" && non_empty_str(input, "team_name").is_some() && non_empty_str(input, "name").is_some()
}

/// Pure base-rule reducer: `session_init`, `status_change`, `result`.
/// `control_response` deliberately causes no mutation here — capabilities
/// are set by the bridge's out-of-band side-channel (spec.md §4.8, §9).
pub fn reduce(state: &Arc<SessionState>, msg: &UnifiedMessage) -> Arc<SessionState> {
    match msg.message_type {
        MessageType::SessionInit => reduce_session_init(state, msg),
        MessageType::StatusChange => reduce_status_change(state, msg),
        MessageType::Result => reduce_result(state, msg),
        _ => Arc::clone(state),
    }
}

fn reduce_session_init(state: &Arc<SessionState>, msg: &UnifiedMessage) -> Arc<SessionState> {
    let meta = &msg.metadata;
    let has_any = ["model", "cwd", "tools", "permissionMode", "claude_code_version", "mcp_servers", "agents", "slash_commands", "skills"]
        .iter()
        .any(|k| meta.contains_key(*k));
    if !has_any {
        return Arc::clone(state);
    }

    let mut next = (**state).clone();
    if let Some(v) = meta.get("model").and_then(Value::as_str) {
        next.model = Some(v.to_owned());
    }
    if let Some(v) = meta.get("cwd").and_then(Value::as_str) {
        next.cwd = Some(v.to_owned());
    }
    if let Some(v) = meta.get("tools").and_then(Value::as_array) {
        next.tools = v.iter().filter_map(Value::as_str).map(str::to_owned).collect();
    }
    if let Some(v) = meta.get("permissionMode").and_then(Value::as_str) {
        next.permission_mode = Some(v.to_owned());
    }
    if let Some(v) = meta.get("claude_code_version").and_then(Value::as_str) {
        next.claude_code_version = Some(v.to_owned());
    }
    if let Some(v) = meta.get("mcp_servers").and_then(Value::as_array) {
        next.mcp_servers = v.iter().filter_map(Value::as_str).map(str::to_owned).collect();
    }
    if let Some(v) = meta.get("agents").and_then(Value::as_array) {
        next.agents = v.iter().filter_map(Value::as_str).map(str::to_owned).collect();
    }
    if let Some(v) = meta.get("slash_commands").and_then(Value::as_array) {
        next.slash_commands = v.iter().filter_map(Value::as_str).map(str::to_owned).collect();
    }
    if let Some(v) = meta.get("skills").and_then(Value::as_array) {
        next.skills = v.iter().filter_map(Value::as_str).map(str::to_owned).collect();
    }
    Arc::new(next)
}

fn reduce_status_change(state: &Arc<SessionState>, msg: &UnifiedMessage) -> Arc<SessionState> {
    let status = msg.meta_str("status");
    let is_compacting = status == Some("compacting");
    let permission_mode = msg.meta_str("permissionMode");
    if is_compacting == state.is_compacting && (permission_mode.is_none() || permission_mode == state.permission_mode.as_deref()) {
        return Arc::clone(state);
    }
    let mut next = (**state).clone();
    next.is_compacting = is_compacting;
    if let Some(mode) = permission_mode {
        next.permission_mode = Some(mode.to_owned());
    }
    Arc::new(next)
}

fn reduce_result(state: &Arc<SessionState>, msg: &UnifiedMessage) -> Arc<SessionState> {
    let meta = &msg.metadata;
    let has_any = ["total_cost_usd", "num_turns", "total_lines_added", "total_lines_removed", "last_duration_ms", "last_duration_api_ms", "modelUsage"]
        .iter()
        .any(|k| meta.contains_key(*k));
    if !has_any {
        return Arc::clone(state);
    }

    let mut next = (**state).clone();
    if let Some(v) = msg.meta_f64("total_cost_usd") {
        next.total_cost_usd = v;
    }
    if let Some(v) = msg.meta_u64("num_turns") {
        next.num_turns = v;
    }
    if let Some(v) = msg.meta_u64("total_lines_added") {
        next.total_lines_added = v;
    }
    if let Some(v) = msg.meta_u64("total_lines_removed") {
        next.total_lines_removed = v;
    }
    if let Some(v) = msg.meta_u64("last_duration_ms") {
        next.last_duration_ms = Some(v);
    }
    if let Some(v) = msg.meta_u64("last_duration_api_ms") {
        next.last_duration_api_ms = Some(v);
    }
    // `serde_json`'s `preserve_order` feature (workspace-wide) backs `Map`
    // with an `IndexMap`, so `.keys().next()` below is the first model key
    // in wire-arrival order, not an alphabetical pick (spec.md §4.8/§8(b)
    // "first model").
    if let Some(usage) = meta.get("modelUsage").and_then(Value::as_object) {
        let parsed: std::collections::HashMap<String, ModelUsage> = usage
            .iter()
            .map(|(name, v)| {
                let usage = ModelUsage {
                    input_tokens: v.get("inputTokens").and_then(Value::as_u64).unwrap_or(0),
                    output_tokens: v.get("outputTokens").and_then(Value::as_u64).unwrap_or(0),
                    context_window: v.get("contextWindow").and_then(Value::as_u64).unwrap_or(0),
                    cost_usd: v.get("costUSD").and_then(Value::as_f64).unwrap_or(0.0),
                };
                (name.clone(), usage)
            })
            .collect();

        if let Some(first) = usage.keys().next().and_then(|k| parsed.get(k)) {
            if first.context_window > 0 {
                let pct = (first.input_tokens + first.output_tokens) as f64 / first.context_window as f64 * 100.0;
                next.context_used_percent = pct;
            }
        }
        next.last_model_usage = Some(parsed);
    }
    Arc::new(next)
}

/// Run the team-tool correlation pre-stage for one message, on top of the
/// base `reduce` output. Mutates `buffer` in place; `buffer` lives on
/// `Session` so no extra locking is needed (spec.md §5's single-owner
/// model already serializes access).
pub fn apply(state: &Arc<SessionState>, buffer: &mut IndexMap<String, BufferedToolUse>, msg: &UnifiedMessage) -> Arc<SessionState> {
    let state = reduce(state, msg);
    let state = observe_tool_uses(state, buffer, msg);
    observe_tool_results(state, buffer, msg)
}

/// Drop buffered tool_uses whose matching tool_result never arrived within
/// [`TEAM_BUFFER_TTL`] (spec.md §5: "Team-tool correlation entries expire
/// after 30 s (flush operation)").
pub fn flush_team_buffer(buffer: &mut IndexMap<String, BufferedToolUse>) {
    buffer.retain(|_, entry| entry.inserted_at.elapsed() < TEAM_BUFFER_TTL);
}

fn observe_tool_uses(state: Arc<SessionState>, buffer: &mut IndexMap<String, BufferedToolUse>, msg: &UnifiedMessage) -> Arc<SessionState> {
    let mut state = state;
    for block in &msg.content {
        let ContentBlock::ToolUse { id, name, input } = block else { continue };
        if !is_team_tool(name, input) {
            continue;
        }
        buffer.insert(id.clone(), BufferedToolUse { tool_name: name.clone(), input: input.clone(), inserted_at: Instant::now() });
        state = apply_optimistic_mutation(state, id, name, input);
    }
    state
}

fn observe_tool_results(state: Arc<SessionState>, buffer: &mut IndexMap<String, BufferedToolUse>, msg: &UnifiedMessage) -> Arc<SessionState> {
    let mut state = state;
    for block in &msg.content {
        let ContentBlock::ToolResult { tool_use_id, content, is_error } = block else { continue };
        let Some(buffered) = buffer.shift_remove(tool_use_id) else { continue };
        if *is_error {
            continue;
        }
        state = apply_confirmed_mutation(state, tool_use_id, &buffered, content);
    }
    state
}

fn team_mut(state: &SessionState) -> TeamState {
    state.team.clone().unwrap_or_default()
}

/// Optimistic mutation applied immediately on `tool_use` (spec.md §4.8:
/// "TeamCreate, Task-as-spawn, TaskCreate with synthetic id
/// `tu-<tool_use_id>`") so the UI stays responsive even if the backend's
/// `tool_result` is slow to arrive.
fn apply_optimistic_mutation(state: Arc<SessionState>, tool_use_id: &str, name: &str, input: &Value) -> Arc<SessionState> {
    match name {
        "TeamCreate" => {
            let mut team = team_mut(&state);
            if let Some(n) = non_empty_str(input, "name") {
                team.name = Some(n.to_owned());
            }
            if let Some(members) = input.get("members").and_then(Value::as_array) {
                team.members = members
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|n| crate::session::state::TeamMember { name: n.to_owned(), role: None })
                    .collect();
            }
            let mut next = (*state).clone();
            next.team = Some(team);
            Arc::new(next)
        }
        "Task" if non_empty_str(input, "team_name").is_some() && non_empty_str(input, "name").is_some() => {
            let mut team = team_mut(&state);
            if team.name.is_none() {
                team.name = non_empty_str(input, "team_name").map(str::to_owned);
            }
            team.members.push(crate::session::state::TeamMember {
                name: non_empty_str(input, "name").unwrap_or_default().to_owned(),
                role: input.get("role").and_then(Value::as_str).map(str::to_owned),
            });
            let mut next = (*state).clone();
            next.team = Some(team);
            Arc::new(next)
        }
        "TaskCreate" => {
            let mut team = team_mut(&state);
            team.tasks.push(TeamTask {
                id: format!("tu-{tool_use_id}"),
                name: non_empty_str(input, "name").unwrap_or_default().to_owned(),
                status: input.get("status").and_then(Value::as_str).unwrap_or("pending").to_owned(),
                owner: input.get("owner").and_then(Value::as_str).map(str::to_owned),
            });
            let mut next = (*state).clone();
            next.team = Some(team);
            Arc::new(next)
        }
        _ => state,
    }
}

/// Confirmed mutation applied once the matching `tool_result` arrives.
fn apply_confirmed_mutation(state: Arc<SessionState>, tool_use_id: &str, buffered: &BufferedToolUse, content: &Value) -> Arc<SessionState> {
    match buffered.tool_name.as_str() {
        "TeamDelete" => {
            if state.team.is_none() {
                return state;
            }
            let mut next = (*state).clone();
            next.team = None;
            Arc::new(next)
        }
        "TaskUpdate" => {
            let Some(mut team) = state.team.clone() else { return state };
            let target_id = non_empty_str(&buffered.input, "id").unwrap_or(tool_use_id);
            let Some(task) = team.tasks.iter_mut().find(|t| t.id == target_id) else { return state };
            if let Some(status) = non_empty_str(&buffered.input, "status") {
                task.status = status.to_owned();
            }
            if let Some(owner) = non_empty_str(&buffered.input, "owner") {
                task.owner = Some(owner.to_owned());
            }
            let mut next = (*state).clone();
            next.team = Some(team);
            Arc::new(next)
        }
        "TaskCreate" => {
            // Reconcile the optimistic synthetic id with a backend-assigned
            // real id, if the tool_result carries one.
            let Some(real_id) = content.get("id").and_then(Value::as_str) else { return state };
            let synthetic_id = format!("tu-{tool_use_id}");
            let Some(mut team) = state.team.clone() else { return state };
            let Some(task) = team.tasks.iter_mut().find(|t| t.id == synthetic_id) else { return state };
            task.id = real_id.to_owned();
            let mut next = (*state).clone();
            next.team = Some(team);
            Arc::new(next)
        }
        _ => state,
    }
}

#[cfg(test)]
#[path = "reducer_tests.rs"]
mod tests;
