// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ACP adapter — direct connect (spec.md §4.1: "other variants use the
//! same interface"). Unlike the socket-based adapters, the Agent Client
//! Protocol speaks newline-delimited JSON-RPC over the child's own
//! stdin/stdout, so this adapter owns the pipes directly instead of going
//! through the Process Supervisor's line-to-event piping.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::{best_effort_decode, AdapterCapabilities, BackendAdapter, BackendAdapterSession, ConnectOptions, DEFAULT_INITIALIZE_TIMEOUT};
use crate::bus::{DomainEvent, EventBus};
use crate::error::{BrokerError, BrokerResult};
use crate::message::UnifiedMessage;
use crate::supervisor;

const DEFAULT_BINARY: &str = "acp-agent";

pub struct AcpAdapter {
    bus: EventBus,
    binary: String,
}

impl AcpAdapter {
    pub fn new(bus: EventBus, binary: Option<String>) -> Self {
        Self { bus, binary: binary.unwrap_or_else(|| DEFAULT_BINARY.to_owned()) }
    }
}

#[async_trait]
impl BackendAdapter for AcpAdapter {
    fn name(&self) -> &'static str {
        "acp"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: false,
            availability: false,
            teams: false,
        }
    }

    async fn connect(&self, opts: ConnectOptions) -> BrokerResult<Arc<dyn BackendAdapterSession>> {
        supervisor::validate_binary_path(&self.binary)?;

        let mut child = tokio::process::Command::new(&self.binary)
            .current_dir(&opts.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()?;

        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take().ok_or_else(|| BrokerError::ConnectFailed("acp stdin unavailable".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| BrokerError::ConnectFailed("acp stdout unavailable".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let bus = self.bus.clone();
            let session_id = opts.session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        bus.publish(DomainEvent::ProcessStderr { session_id: session_id.clone(), line });
                    }
                }
            });
        }

        self.bus.publish(DomainEvent::ProcessSpawned { session_id: opts.session_id.clone(), pid });

        let session = AcpSession::new(opts.session_id.clone(), child, stdin, stdout, self.bus.clone());

        let deadline = Instant::now() + DEFAULT_INITIALIZE_TIMEOUT;
        match tokio::time::timeout(deadline.saturating_duration_since(Instant::now()), session.handshake()).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                session.close().await;
                return Err(e);
            }
            Err(_) => {
                session.close().await;
                return Err(BrokerError::ConnectTimeout(DEFAULT_INITIALIZE_TIMEOUT));
            }
        }

        self.bus.publish(DomainEvent::BackendConnected { session_id: opts.session_id.clone() });
        Ok(Arc::new(session))
    }
}

struct AcpSession {
    session_id: String,
    stdin: Mutex<ChildStdin>,
    inbound: Mutex<mpsc::UnboundedReceiver<UnifiedMessage>>,
    handshake_rx: Mutex<Option<mpsc::UnboundedReceiver<serde_json::Value>>>,
    closed: AtomicBool,
    child: Mutex<Child>,
    pid: u32,
}

impl AcpSession {
    fn new(
        session_id: String,
        child: Child,
        stdin: ChildStdin,
        stdout: tokio::process::ChildStdout,
        bus: EventBus,
    ) -> Self {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (hs_tx, hs_rx) = mpsc::unbounded_channel();

        let sid = session_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if !line.is_empty() => {
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
                            if value.get("id").is_some() && value.get("method").is_none() {
                                let _ = hs_tx.send(value);
                                continue;
                            }
                        }
                        if in_tx.send(best_effort_decode(&line)).is_err() {
                            break;
                        }
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(session_id = %sid, err = %e, "acp stdout read error");
                        break;
                    }
                }
            }
            bus.publish(DomainEvent::BackendDisconnected { session_id: sid.clone() });
        });

        Self {
            session_id,
            stdin: Mutex::new(stdin),
            inbound: Mutex::new(in_rx),
            handshake_rx: Mutex::new(Some(hs_rx)),
            closed: AtomicBool::new(false),
            pid: child.id().unwrap_or(0),
            child: Mutex::new(child),
        }
    }

    async fn write_line(&self, value: &serde_json::Value) -> BrokerResult<()> {
        let mut line = value.to_string();
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await.map_err(BrokerError::SpawnFailed)
    }

    async fn handshake(&self) -> BrokerResult<()> {
        self.write_line(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": { "sessionId": self.session_id },
        }))
        .await?;

        let mut rx = self.handshake_rx.lock().await.take().ok_or(BrokerError::BackendClosed)?;
        let response = rx.recv().await.ok_or(BrokerError::BackendClosed)?;
        *self.handshake_rx.lock().await = Some(rx);

        if response.get("error").is_some() {
            return Err(BrokerError::ConnectFailed(format!("acp initialize rejected: {response}")));
        }
        debug!(session_id = %self.session_id, "acp handshake complete");
        Ok(())
    }
}

#[async_trait]
impl BackendAdapterSession for AcpSession {
    async fn recv(&self) -> Option<UnifiedMessage> {
        self.inbound.lock().await.recv().await
    }

    async fn send(&self, msg: &UnifiedMessage) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::BackendClosed);
        }
        let value = serde_json::to_value(msg).map_err(|e| BrokerError::Other(e.into()))?;
        self.write_line(&value).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let grace = Duration::from_secs(5);
        if !crate::registry::is_process_alive(self.pid) {
            return;
        }
        let pid = self.pid;
        let deadline = Instant::now() + grace;
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        while crate::registry::is_process_alive(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if crate::registry::is_process_alive(pid) {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        let _ = self.child.lock().await.wait().await;
    }
}
