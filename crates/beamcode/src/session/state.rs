// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Derived per-session state (spec.md §3 "SessionState"), owned by the
//! State Reducer (spec.md §4.8).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A model usage entry from the adapter's `modelUsage` metadata field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub context_window: u64,
    pub cost_usd: f64,
}

/// A team member recognized via team-tool correlation (spec.md §4.8).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    pub name: String,
    pub role: Option<String>,
}

/// A task recognized via team-tool correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamTask {
    pub id: String,
    pub name: String,
    pub status: String,
    pub owner: Option<String>,
}

/// Optional team sub-entity maintained by team-tool correlation (spec.md
/// §3, §4.8).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamState {
    pub name: Option<String>,
    pub members: Vec<TeamMember>,
    pub tasks: Vec<TeamTask>,
}

/// Derived snapshot rebuilt by the State Reducer on each inbound
/// `UnifiedMessage` (spec.md §3, §4.8). Equality here is used only by
/// tests; the reducer's referential-equality discipline is enforced by
/// `Arc`/clone-on-write at the call site, not by this type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub tools: Vec<String>,
    pub permission_mode: Option<String>,
    pub mcp_servers: Vec<String>,
    pub agents: Vec<String>,
    pub slash_commands: Vec<String>,
    pub skills: Vec<String>,
    pub claude_code_version: Option<String>,

    pub total_cost_usd: f64,
    pub num_turns: u64,
    pub context_used_percent: f64,
    pub is_compacting: bool,

    pub total_lines_added: u64,
    pub total_lines_removed: u64,

    pub last_duration_ms: Option<u64>,
    pub last_duration_api_ms: Option<u64>,
    pub last_model_usage: Option<HashMap<String, ModelUsage>>,

    pub team: Option<TeamState>,
}

impl SessionState {
    pub fn new(session_id: String) -> Self {
        Self { session_id, ..Default::default() }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
