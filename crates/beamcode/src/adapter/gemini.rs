// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Gemini A2A adapter — direct connect (spec.md §4.1): launch a local SSE
//! HTTP server, `POST` the initial task, then consume `text/event-stream`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::{best_effort_decode, AdapterCapabilities, BackendAdapter, BackendAdapterSession, ConnectOptions, DEFAULT_INITIALIZE_TIMEOUT};
use crate::bus::{DomainEvent, EventBus};
use crate::error::{BrokerError, BrokerResult};
use crate::message::{ContentBlock, MessageType, Role, UnifiedMessage};
use crate::supervisor::{self, SpawnSpec};

const DEFAULT_BINARY: &str = "gemini";
const DEFAULT_BASE_PORT: u16 = 41000;

pub struct GeminiAdapter {
    bus: EventBus,
    binary: String,
}

impl GeminiAdapter {
    pub fn new(bus: EventBus, binary: Option<String>) -> Self {
        Self { bus, binary: binary.unwrap_or_else(|| DEFAULT_BINARY.to_owned()) }
    }
}

#[async_trait]
impl BackendAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: false,
            slash_commands: false,
            availability: true,
            teams: false,
        }
    }

    async fn connect(&self, opts: ConnectOptions) -> BrokerResult<Arc<dyn BackendAdapterSession>> {
        let port = DEFAULT_BASE_PORT
            .wrapping_add((seahash(&opts.session_id) % 2000) as u16);
        let spec = SpawnSpec {
            program: self.binary.clone(),
            args: vec!["serve".to_owned(), "--a2a-port".to_owned(), port.to_string()],
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

        let task_resp = client
            .post(format!("{base}/tasks"))
            .json(&json!({ "sessionId": opts.session_id, "cwd": opts.cwd }))
            .send()
            .await
            .map_err(|e| BrokerError::ConnectFailed(format!("gemini task create failed: {e}")))?;
        let task: serde_json::Value = task_resp
            .json()
            .await
            .map_err(|e| BrokerError::ConnectFailed(format!("gemini task create malformed: {e}")))?;
        let task_id = task
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrokerError::ConnectFailed("gemini task response missing id".into()))?
            .to_owned();

        let events_resp = client
            .get(format!("{base}/tasks/{task_id}/events"))
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| BrokerError::ConnectFailed(format!("gemini event stream failed: {e}")))?;

        self.bus.publish(DomainEvent::BackendConnected { session_id: opts.session_id.clone() });
        Ok(Arc::new(GeminiSession::new(opts.session_id, client, base, task_id, events_resp, handle)))
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

/// Cheap deterministic hash so repeated sessions don't collide on the same
/// ephemeral port; not a cryptographic hash.
fn seahash(s: &str) -> u64 {
    let mut h: u64 = 1469598103934665603;
    for b in s.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    h
}

struct GeminiSession {
    session_id: String,
    client: reqwest::Client,
    base: String,
    task_id: String,
    inbound: Mutex<mpsc::UnboundedReceiver<UnifiedMessage>>,
    closed: AtomicBool,
    process: Arc<supervisor::ProcessHandle>,
}

impl GeminiSession {
    fn new(
        session_id: String,
        client: reqwest::Client,
        base: String,
        task_id: String,
        response: reqwest::Response,
        process: Arc<supervisor::ProcessHandle>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let sid = session_id.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buf = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(session_id = %sid, err = %e, "gemini sse read error");
                        break;
                    }
                };
                buf.extend_from_slice(&chunk);
                while let Some(pos) = find_event_boundary(&buf) {
                    let event: Bytes = buf.split_to(pos).freeze();
                    let _ = buf.split_to(2); // consume the blank-line separator
                    if let Some(data) = extract_sse_data(&event) {
                        if tx.send(decode_a2a_event(&data)).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Self { session_id, client, base, task_id, inbound: Mutex::new(rx), closed: AtomicBool::new(false), process }
    }
}

fn find_event_boundary(buf: &BytesMut) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn extract_sse_data(event: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(event);
    let mut data = String::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data.push_str(rest.trim_start());
        }
    }
    if data.is_empty() {
        None
    } else {
        Some(data)
    }
}

fn decode_a2a_event(data: &str) -> UnifiedMessage {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
        if let Some(text) = value.get("text").and_then(|v| v.as_str()) {
            return UnifiedMessage::new(MessageType::Assistant, Role::Assistant)
                .with_content(vec![ContentBlock::Text { text: text.to_owned() }]);
        }
    }
    best_effort_decode(data)
}

#[async_trait]
impl BackendAdapterSession for GeminiSession {
    async fn recv(&self) -> Option<UnifiedMessage> {
        self.inbound.lock().await.recv().await
    }

    async fn send(&self, msg: &UnifiedMessage) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::BackendClosed);
        }
        let url = format!("{}/tasks/{}/messages", self.base, self.task_id);
        self.client
            .post(url)
            .json(msg)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::ConnectFailed(format!("gemini send failed: {e}")))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let url = format!("{}/tasks/{}", self.base, self.task_id);
        let _ = self.client.delete(url).send().await;
        self.process.kill(Duration::from_secs(5)).await;
        debug!(session_id = %self.session_id, "gemini session closed");
    }
}
