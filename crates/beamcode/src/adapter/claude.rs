// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Claude SDK adapter — inverted connection (spec.md §4.1): the broker
//! launches the CLI pointed at its own `/ws/cli/:sid` route and waits for
//! the CLI to dial back in, rather than dialing out itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::{
    best_effort_decode, encode_outbound, AdapterCapabilities, BackendAdapter, BackendAdapterSession,
    ConnectOptions, InvertedRegistry, PassthroughHandler, DEFAULT_INITIALIZE_TIMEOUT,
};
use crate::bus::{DomainEvent, EventBus};
use crate::error::{BrokerError, BrokerResult};
use crate::message::UnifiedMessage;
use crate::supervisor::{self, SpawnSpec};

const DEFAULT_BINARY: &str = "claude";

pub struct ClaudeAdapter {
    bus: EventBus,
    registry: Arc<InvertedRegistry>,
    binary: String,
}

impl ClaudeAdapter {
    pub fn new(bus: EventBus, registry: Arc<InvertedRegistry>, binary: Option<String>) -> Self {
        Self { bus, registry, binary: binary.unwrap_or_else(|| DEFAULT_BINARY.to_owned()) }
    }
}

#[async_trait]
impl BackendAdapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: true,
            availability: true,
            teams: true,
        }
    }

    async fn connect(&self, opts: ConnectOptions) -> BrokerResult<Arc<dyn BackendAdapterSession>> {
        let port = std::env::var("BEAMCODE_PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8787);
        let sdk_url = format!("ws://127.0.0.1:{port}/ws/cli/{}", opts.session_id);

        let rx = self.registry.reserve(&opts.session_id).await;

        let mut args = vec!["--sdk-url".to_owned(), sdk_url];
        if let Some(resume) = &opts.resume {
            args.push("--resume".to_owned());
            args.push(resume.clone());
        }

        let spec = SpawnSpec {
            program: self.binary.clone(),
            args,
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

        let socket = match tokio::time::timeout(DEFAULT_INITIALIZE_TIMEOUT, rx).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(_)) => {
                handle.kill(supervisor::DEFAULT_KILL_GRACE).await;
                return Err(BrokerError::ConnectFailed("cli hung up before connecting back".into()));
            }
            Err(_) => {
                self.registry.cancel(&opts.session_id).await;
                handle.kill(supervisor::DEFAULT_KILL_GRACE).await;
                return Err(BrokerError::ConnectTimeout(DEFAULT_INITIALIZE_TIMEOUT));
            }
        };

        debug!(session_id = %opts.session_id, pid = handle.pid, "claude cli connected back");
        self.bus.publish(DomainEvent::CliConnected { session_id: opts.session_id.clone() });

        Ok(Arc::new(ClaudeSession::new(opts.session_id, socket, handle)))
    }
}

struct ClaudeSession {
    session_id: String,
    outbound: mpsc::UnboundedSender<WsMessage>,
    inbound: Mutex<mpsc::UnboundedReceiver<UnifiedMessage>>,
    passthrough: Mutex<Option<PassthroughHandler>>,
    closed: AtomicBool,
    process: Arc<supervisor::ProcessHandle>,
}

impl ClaudeSession {
    fn new(session_id: String, socket: WebSocket, process: Arc<supervisor::ProcessHandle>) -> Self {
        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<UnifiedMessage>();

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let sid = session_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        if in_tx.send(best_effort_decode(text.as_str())).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(session_id = %sid, err = %e, "claude cli socket error");
                        break;
                    }
                }
            }
        });

        Self {
            session_id,
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
            passthrough: Mutex::new(None),
            closed: AtomicBool::new(false),
            process,
        }
    }
}

#[async_trait]
impl BackendAdapterSession for ClaudeSession {
    async fn recv(&self) -> Option<UnifiedMessage> {
        self.inbound.lock().await.recv().await
    }

    async fn send(&self, msg: &UnifiedMessage) -> BrokerResult<()> {
        if let Some(handler) = self.passthrough.lock().await.as_ref() {
            if handler(msg) {
                return Ok(());
            }
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::BackendClosed);
        }
        let text = encode_outbound(msg)?;
        self.outbound
            .send(WsMessage::Text(text.into()))
            .map_err(|_| BrokerError::BackendClosed)
    }

    async fn send_raw(&self, bytes: Bytes) -> BrokerResult<()> {
        self.outbound
            .send(WsMessage::Binary(bytes))
            .map_err(|_| BrokerError::BackendClosed)
    }

    fn supports_send_raw(&self) -> bool {
        true
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.send(WsMessage::Close(None));
        self.process.kill(Duration::from_secs(5)).await;
        debug!(session_id = %self.session_id, "claude session closed");
    }

    fn set_passthrough_handler(&self, handler: PassthroughHandler) {
        if let Ok(mut guard) = self.passthrough.try_lock() {
            *guard = Some(handler);
        }
    }
}
