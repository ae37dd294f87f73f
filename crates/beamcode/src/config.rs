// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// BeamCode daemon configuration, resolved from CLI flags and environment
/// variables (spec.md §6's "Environment variables observed at startup").
#[derive(Debug, Clone, Parser)]
#[command(name = "beamcoded", version, about = "BeamCode session broker daemon.")]
pub struct Config {
    /// HTTP/WebSocket port to listen on.
    #[arg(long, env = "BEAMCODE_PORT", default_value = "4317")]
    pub port: u16,

    /// Host address to bind to.
    #[arg(long, env = "BEAMCODE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Optional bearer token required on `/api/*` and the consumer WebSocket
    /// when the tunnel is enabled. Auth is disabled when unset.
    #[arg(long, env = "BEAMCODE_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Directory holding the session and launcher storage buckets.
    #[arg(long, env = "BEAMCODE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Force a specific adapter for every created session, bypassing
    /// per-request `adapterName` resolution. Primarily for testing.
    #[arg(long, env = "BEAMCODE_ADAPTER")]
    pub adapter: Option<String>,

    /// Disable auto-launching backend CLIs on session create; sessions are
    /// registered but left in `starting` until a client explicitly connects.
    #[arg(long, env = "BEAMCODE_NO_AUTO_LAUNCH", default_value_t = false)]
    pub no_auto_launch: bool,

    /// Enable the best-effort message tracer.
    #[arg(long, env = "BEAMCODE_TRACE", default_value_t = false)]
    pub trace: bool,

    /// Tracer verbosity (`summary` or `full`).
    #[arg(long, env = "BEAMCODE_TRACE_LEVEL", default_value = "summary")]
    pub trace_level: String,

    /// Allow the tracer to log raw message content (may contain secrets).
    #[arg(long, env = "BEAMCODE_TRACE_ALLOW_SENSITIVE", default_value_t = false)]
    pub trace_allow_sensitive: bool,

    /// Runtime mode tag surfaced in logs and `/health` (e.g. `dev`, `prod`).
    #[arg(long, env = "BEAMCODE_CORE_RUNTIME_MODE", default_value = "prod")]
    pub core_runtime_mode: String,

    /// Expose a Prometheus `/metrics` endpoint.
    #[arg(long, env = "BEAMCODE_PROMETHEUS", default_value_t = false)]
    pub prometheus: bool,

    /// Maximum concurrent sessions (spec.md §4.4).
    #[arg(long, env = "BEAMCODE_MAX_SESSIONS", default_value = "32")]
    pub max_sessions: usize,

    /// Log format (json or text).
    #[arg(long, env = "BEAMCODE_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "BEAMCODE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing. Failures here are
    /// "configuration fatal" per spec.md §7 and abort startup with exit 1.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.log_format != "json" && self.log_format != "text" {
            anyhow::bail!("invalid --log-format: {}", self.log_format);
        }
        if self.max_sessions == 0 {
            anyhow::bail!("--max-sessions must be at least 1");
        }
        if self.trace_level != "summary" && self.trace_level != "full" {
            anyhow::bail!("invalid --trace-level: {}", self.trace_level);
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| std::env::temp_dir().join("beamcode"))
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
