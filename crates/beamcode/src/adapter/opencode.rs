// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OpenCode adapter — direct connect over HTTP + SSE subscribe (spec.md
//! §4.1): turn-based, prompts are `POST`ed and events arrive over a
//! subscribed `text/event-stream`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{best_effort_decode, AdapterCapabilities, BackendAdapter, BackendAdapterSession, ConnectOptions, DEFAULT_INITIALIZE_TIMEOUT};
use crate::bus::{DomainEvent, EventBus};
use crate::error::{BrokerError, BrokerResult};
use crate::message::UnifiedMessage;
use crate::supervisor::{self, SpawnSpec};

const DEFAULT_BINARY: &str = "opencode";
const DEFAULT_PORT: u16 = 42000;

pub struct OpenCodeAdapter {
    bus: EventBus,
    binary: String,
}

impl OpenCodeAdapter {
    pub fn new(bus: EventBus, binary: Option<String>) -> Self {
        Self { bus, binary: binary.unwrap_or_else(|| DEFAULT_BINARY.to_owned()) }
    }
}

#[async_trait]
impl BackendAdapter for OpenCodeAdapter {
    fn name(&self) -> &'static str {
        "opencode"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: true,
            availability: false,
            teams: false,
        }
    }

    async fn connect(&self, opts: ConnectOptions) -> BrokerResult<Arc<dyn BackendAdapterSession>> {
        let port = DEFAULT_PORT.wrapping_add((opts.session_id.len() % 500) as u16);
        let spec = SpawnSpec {
            program: self.binary.clone(),
            args: vec!["serve".to_owned(), "--port".to_owned(), port.to_string()],
            cwd: opts.cwd.clone(),
            env: Default::default(),
        };
        let breaker = Arc::new(crate::circuit::CircuitBreaker::new(Default::default()));
        let handle = supervisor::spawn_process(
            &opts.session_id,
            spec,
            None,
            breaker,
            self.bus.clone(),
            supervisor::DEFAULT_CRASH_THRESHOLD,
        )
        .await?;

        let base = format!("http://127.0.0.1:{port}");
        let client = reqwest::Client::new();
        let deadline = Instant::now() + DEFAULT_INITIALIZE_TIMEOUT;
        if !poll_ready(&client, &base, deadline).await {
            handle.kill(supervisor::DEFAULT_KILL_GRACE).await;
            return Err(BrokerError::ConnectTimeout(DEFAULT_INITIALIZE_TIMEOUT));
        }

        let session_resp = client
            .post(format!("{base}/session"))
            .json(&json!({ "cwd": opts.cwd, "resume": opts.resume }))
            .send()
            .await
            .map_err(|e| BrokerError::ConnectFailed(format!("opencode session create failed: {e}")))?;
        let body: serde_json::Value = session_resp
            .json()
            .await
            .map_err(|e| BrokerError::ConnectFailed(format!("opencode session create malformed: {e}")))?;
        let vendor_session_id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrokerError::ConnectFailed("opencode session response missing id".into()))?
            .to_owned();

        let subscribe = client
            .get(format!("{base}/session/{vendor_session_id}/subscribe"))
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| BrokerError::ConnectFailed(format!("opencode subscribe failed: {e}")))?;

        self.bus.publish(DomainEvent::BackendConnected { session_id: opts.session_id.clone() });
        Ok(Arc::new(OpenCodeSession::new(
            opts.session_id,
            client,
            base,
            vendor_session_id,
            subscribe,
            handle,
        )))
    }
}

async fn poll_ready(client: &reqwest::Client, base: &str, deadline: Instant) -> bool {
    while Instant::now() < deadline {
        if client.get(format!("{base}/health")).send().await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    false
}

struct OpenCodeSession {
    session_id: String,
    client: reqwest::Client,
    base: String,
    vendor_session_id: String,
    inbound: Mutex<mpsc::UnboundedReceiver<UnifiedMessage>>,
    closed: AtomicBool,
    process: Arc<supervisor::ProcessHandle>,
}

impl OpenCodeSession {
    fn new(
        session_id: String,
        client: reqwest::Client,
        base: String,
        vendor_session_id: String,
        response: reqwest::Response,
        process: Arc<supervisor::ProcessHandle>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buf = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.windows(2).position(|w| w == b"\n\n") {
                    let event = buf.split_to(pos).freeze();
                    let _ = buf.split_to(2);
                    let text = String::from_utf8_lossy(&event);
                    let data: String = text
                        .lines()
                        .filter_map(|l| l.strip_prefix("data:"))
                        .map(|l| l.trim_start())
                        .collect();
                    if !data.is_empty() && tx.send(best_effort_decode(&data)).is_err() {
                        return;
                    }
                }
            }
        });

        Self { session_id, client, base, vendor_session_id, inbound: Mutex::new(rx), closed: AtomicBool::new(false), process }
    }
}

#[async_trait]
impl BackendAdapterSession for OpenCodeSession {
    async fn recv(&self) -> Option<UnifiedMessage> {
        self.inbound.lock().await.recv().await
    }

    async fn send(&self, msg: &UnifiedMessage) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::BackendClosed);
        }
        let url = format!("{}/session/{}/message", self.base, self.vendor_session_id);
        self.client
            .post(url)
            .json(msg)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::ConnectFailed(format!("opencode send failed: {e}")))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let url = format!("{}/session/{}", self.base, self.vendor_session_id);
        let _ = self.client.delete(url).send().await;
        self.process.kill(Duration::from_secs(5)).await;
        debug!(session_id = %self.session_id, "opencode session closed");
    }
}
