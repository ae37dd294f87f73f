// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process Supervisor (spec.md §4.2) — generic base for any adapter that
//! owns a child process. Spawns, pipes output, escalates SIGTERM→SIGKILL,
//! exposes an exited future, and feeds the circuit breaker.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::bus::{DomainEvent, EventBus};
use crate::circuit::CircuitBreaker;
use crate::error::{BrokerError, BrokerResult};

/// Environment variables stripped before every spawn (spec.md §4.2).
const DEFAULT_ENV_DENY_LIST: &[&str] = &["LD_PRELOAD", "DYLD_INSERT_LIBRARIES", "NODE_OPTIONS"];

/// Host-specific nesting-guard variable, removed so a spawned CLI doesn't
/// believe it is itself running inside a coding-agent session.
const NESTING_GUARD_VAR: &str = "CLAUDECODE";

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);
/// Default uptime threshold under which an exit counts as a circuit-breaker
/// failure.
pub const DEFAULT_CRASH_THRESHOLD: Duration = Duration::from_secs(5);

#[allow(clippy::expect_used)]
static BASENAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("regex"));
#[allow(clippy::expect_used)]
static ABSOLUTE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/[A-Za-z0-9_./-]+$").expect("regex"));

/// Validate a launcher binary path against spec.md §4.2's allow-list. No
/// shell is ever invoked regardless of the outcome.
pub fn validate_binary_path(path: &str) -> BrokerResult<()> {
    if BASENAME_RE.is_match(path) || ABSOLUTE_RE.is_match(path) {
        Ok(())
    } else {
        Err(BrokerError::InvalidBinaryPath(path.to_owned()))
    }
}

/// Optional synchronous interceptor run immediately before spawn; throwing
/// aborts the spawn and marks the session exited (spec.md §4.2).
pub type BeforeSpawnHook = Arc<dyn Fn(&str, &mut SpawnSpec) -> BrokerResult<()> + Send + Sync>;

/// What to launch.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: HashMap<String, String>,
}

/// A live child process handle.
pub struct ProcessHandle {
    pub pid: u32,
    child: Mutex<Option<Child>>,
    exited_rx: Mutex<Option<oneshot::Receiver<Option<i32>>>>,
    killed: AtomicBool,
}

impl ProcessHandle {
    /// Escalate SIGTERM→SIGKILL (spec.md §4.2). Idempotent.
    pub async fn kill(&self, grace: Duration) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        kill_pid(self.pid, grace).await;
    }

    /// Await the one-shot exit future.
    pub async fn exited(&self) -> Option<i32> {
        let rx = self.exited_rx.lock().await.take();
        match rx {
            Some(rx) => rx.await.unwrap_or(None),
            None => None,
        }
    }
}

/// SIGTERM→SIGKILL escalation by bare pid, for callers (e.g. the Session
/// Coordinator's `deleteSession`) that only have a registry-persisted pid
/// rather than a live `ProcessHandle`.
pub async fn kill_pid(pid: u32, grace: Duration) {
    let Ok(pid_i32) = i32::try_from(pid) else { return };
    let _ = signal::kill(Pid::from_raw(pid_i32), Signal::SIGTERM);

    let deadline = Instant::now() + grace;
    loop {
        if !crate::registry::is_process_alive(pid) {
            return;
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    if crate::registry::is_process_alive(pid) {
        let _ = signal::kill(Pid::from_raw(pid_i32), Signal::SIGKILL);
    }
}

/// Concurrent fan-out kill of every tracked process.
pub async fn kill_all(handles: &[Arc<ProcessHandle>], grace: Duration) {
    let futures = handles.iter().map(|h| h.kill(grace));
    futures_util::future::join_all(futures).await;
}

/// Spawn a child process for `session_id` per `spec`, piping output and
/// feeding `breaker`/`bus` on exit. Binary path is validated first; an
/// invalid path never reaches `Command::spawn`.
pub async fn spawn_process(
    session_id: &str,
    mut spec: SpawnSpec,
    before_spawn: Option<&BeforeSpawnHook>,
    breaker: Arc<CircuitBreaker>,
    bus: EventBus,
    crash_threshold: Duration,
) -> BrokerResult<Arc<ProcessHandle>> {
    validate_binary_path(&spec.program)?;

    if let Some(hook) = before_spawn {
        hook(session_id, &mut spec)?;
    }

    for var in DEFAULT_ENV_DENY_LIST {
        spec.env.remove(*var);
    }
    spec.env.remove(NESTING_GUARD_VAR);

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .env_clear()
        .envs(std::env::vars().filter(|(k, _)| {
            !DEFAULT_ENV_DENY_LIST.contains(&k.as_str()) && k != NESTING_GUARD_VAR
        }))
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    let mut child = cmd.spawn()?;
    let pid = child.id().unwrap_or(0);

    if let Some(stdout) = child.stdout.take() {
        let bus = bus.clone();
        let session_id = session_id.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    bus.publish(DomainEvent::ProcessStdout {
                        session_id: session_id.clone(),
                        line,
                    });
                }
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let bus = bus.clone();
        let session_id = session_id.to_owned();
        tokio::spawn(async move {
            // Backpressure policy: drop-on-overflow is acceptable for
            // stderr tracing (spec.md §4.2); never block the process.
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    bus.publish(DomainEvent::ProcessStderr {
                        session_id: session_id.clone(),
                        line,
                    });
                }
            }
        });
    }

    let (exited_tx, exited_rx) = oneshot::channel();
    {
        let bus = bus.clone();
        let session_id = session_id.to_owned();
        let started_at = Instant::now();
        tokio::spawn(async move {
            let status = child.wait().await.ok();
            let exit_code = status.and_then(|s| s.code());
            let uptime_ms = started_at.elapsed().as_millis() as u64;

            if started_at.elapsed() < crash_threshold {
                breaker.record_failure().await;
            } else {
                breaker.record_success().await;
            }

            let snapshot = breaker.snapshot().await;
            debug!(
                session_id = %session_id,
                exit_code = ?exit_code,
                uptime_ms,
                breaker_state = ?snapshot.as_ref().map(|s| s.state),
                "process exited"
            );
            bus.publish(DomainEvent::ProcessExited {
                session_id,
                exit_code,
                uptime_ms,
                circuit_breaker: snapshot,
            });
            let _ = exited_tx.send(exit_code);
        });
    }

    bus.publish(DomainEvent::ProcessSpawned { session_id: session_id.to_owned(), pid });

    Ok(Arc::new(ProcessHandle {
        pid,
        child: Mutex::new(None),
        exited_rx: Mutex::new(Some(exited_rx)),
        killed: AtomicBool::new(false),
    }))
}

/// Emit a fatal spawn-rejection event for an invalid binary path without
/// ever invoking the OS exec (spec.md invariant #10).
pub fn reject_invalid_binary(session_id: &str, bus: &EventBus, path: &str) {
    warn!(session_id, path, "rejected spawn: invalid binary path");
    bus.publish(DomainEvent::ProcessExited {
        session_id: session_id.to_owned(),
        exit_code: Some(-1),
        uptime_ms: 0,
        circuit_breaker: None,
    });
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
