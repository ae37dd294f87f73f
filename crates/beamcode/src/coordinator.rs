// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Coordinator (spec.md §4.9) — the top-level orchestrator. Wires
//! every other component, owns the live `Session` table, and is the only
//! component that creates or destroys sessions.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapter::{BackendAdapter, ConnectOptions};
use crate::broadcaster::ConsumerBroadcaster;
use crate::bus::{DomainEvent, EventBus};
use crate::error::{BrokerError, BrokerResult, ErrorCode};
use crate::lifecycle::BackendLifecycleManager;
use crate::message::{ContentBlock, MessageType, Role, UnifiedMessage};
use crate::permission::Behavior;
use crate::recovery::{RecoveryConfig, RecoveryService};
use crate::reducer;
use crate::registry::SessionRegistry;
use crate::session::{ConsumerRole, LifecycleState, Session, SessionInfo};
use crate::storage::Storage;
use crate::supervisor;

/// Point-in-time view of a session's recovery-relevant fields, handed to the
/// [`RecoveryService`] so it never needs to reach into `Session` fields
/// directly (spec.md §4.10's launcher/bridge split).
#[derive(Debug, Clone)]
pub struct RecoverySnapshot {
    pub adapter_name: String,
    pub cwd: String,
    pub pid: Option<u32>,
    pub backend_session_id: Option<String>,
    pub lifecycle_state: LifecycleState,
    pub archived: bool,
    pub has_backend: bool,
}

/// Arguments to [`SessionCoordinator::create_session`].
#[derive(Debug, Clone)]
pub struct CreateSessionOpts {
    pub cwd: String,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub adapter_name: Option<String>,
}

/// Marker text for the lifecycle manager's synthetic "backend connection
/// lost" error (spec.md §4.5); matched here so the coordinator can trigger
/// permission cancellation broadcast at the correct point in the dirty
/// disconnect sequence — before the lifecycle manager clears the map.
const BACKEND_LOST_MARKER: &str = "backend connection lost";

fn is_backend_lost(msg: &UnifiedMessage) -> bool {
    msg.message_type == MessageType::Error
        && msg.content.iter().any(|b| matches!(b, ContentBlock::Text { text } if text == BACKEND_LOST_MARKER))
}

/// Message types a consumer frame carries that mutate backend-facing state;
/// an `observer` attempting one of these is rejected (spec.md §8 invariant
/// #5).
fn is_mutating(message_type: MessageType) -> bool {
    matches!(
        message_type,
        MessageType::UserMessage | MessageType::PermissionResponse | MessageType::Interrupt | MessageType::ControlRequest
    )
}

pub struct SessionCoordinator {
    bus: EventBus,
    registry: Arc<SessionRegistry>,
    storage: Arc<dyn Storage>,
    lifecycle: Arc<BackendLifecycleManager>,
    broadcaster: Arc<ConsumerBroadcaster>,
    mediator: Arc<crate::permission::PermissionMediator>,
    adapters: HashMap<String, Arc<dyn BackendAdapter>>,
    default_adapter: String,
    no_auto_launch: bool,
    sessions: RwLock<IndexMap<String, Arc<Mutex<Session>>>>,
    relay_cancel: CancellationToken,
    recovery_cancel: CancellationToken,
    recovery: Arc<RecoveryService>,
    tracer: Arc<crate::tracer::Tracer>,
}

impl SessionCoordinator {
    /// Constructs the coordinator together with the lifecycle manager's
    /// router, which must call back into `route_unified_message` without
    /// the coordinator owning itself directly (spec.md §9 "cyclic
    /// references"): a `Weak` is captured in the router closure and
    /// upgraded per invocation, a no-op once the coordinator is dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: EventBus,
        registry: Arc<SessionRegistry>,
        storage: Arc<dyn Storage>,
        adapters: HashMap<String, Arc<dyn BackendAdapter>>,
        default_adapter: String,
        no_auto_launch: bool,
        tracer: Arc<crate::tracer::Tracer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<SessionCoordinator>| {
            let weak_for_router = weak.clone();
            let router: crate::lifecycle::RouteFn = Arc::new(move |session, msg| {
                let weak = weak_for_router.clone();
                Box::pin(async move {
                    if let Some(this) = weak.upgrade() {
                        this.route_unified_message(session, msg).await;
                    }
                })
            });

            let lifecycle = Arc::new(BackendLifecycleManager::new(bus.clone(), router, Arc::clone(&tracer)));
            let broadcaster = Arc::new(ConsumerBroadcaster::new(bus.clone()));
            let mediator = Arc::new(crate::permission::PermissionMediator::new(
                bus.clone(),
                Arc::clone(&lifecycle),
                Arc::clone(&broadcaster),
            ));
            let recovery = RecoveryService::new(bus.clone(), weak.clone(), RecoveryConfig::default());

            Self {
                bus,
                registry,
                storage,
                lifecycle,
                broadcaster,
                mediator,
                adapters,
                default_adapter,
                no_auto_launch,
                sessions: RwLock::new(IndexMap::new()),
                relay_cancel: CancellationToken::new(),
                recovery_cancel: CancellationToken::new(),
                recovery,
                tracer,
            }
        })
    }

    /// Begin serving: restore persisted launcher state and start the
    /// domain-event relay and the Recovery Service's watch loop (spec.md
    /// §4.9 "event forwarding", §4.10).
    pub async fn start(self: &Arc<Self>) -> BrokerResult<()> {
        self.registry.restore_from_storage().await?;
        self.spawn_event_relay();
        self.recovery.clone().spawn(self.recovery_cancel.clone());
        Ok(())
    }

    /// Stop serving: kill every tracked process and detach every consumer.
    pub async fn stop(self: &Arc<Self>) {
        self.relay_cancel.cancel();
        self.recovery_cancel.cancel();
        let sessions: Vec<Arc<Mutex<Session>>> = self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            let pid = session.lock().await.pid;
            self.lifecycle.disconnect_backend(Arc::clone(&session)).await;
            if let Some(pid) = pid {
                supervisor::kill_pid(pid, supervisor::DEFAULT_KILL_GRACE).await;
            }
            self.broadcaster.close_all(session).await;
        }
    }

    fn spawn_event_relay(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut events = this.bus.subscribe();
        let cancel = this.relay_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => {
                        match event {
                            Ok(event) => this.handle_domain_event(event).await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        });
    }

    /// Translate a subset of domain events into broadcast UnifiedMessages
    /// consumers observe live (spec.md §4.9 "forwards ... events to a
    /// domain event bus and to the coordinator's external emitter").
    async fn handle_domain_event(&self, event: DomainEvent) {
        match event {
            DomainEvent::CliConnected { session_id } => {
                if let Some(session) = self.get_live(&session_id).await {
                    let msg = UnifiedMessage::new(MessageType::CliConnected, Role::System);
                    self.broadcaster.broadcast(session, &msg).await;
                }
            }
            DomainEvent::CliDisconnected { session_id } => {
                if let Some(session) = self.get_live(&session_id).await {
                    let msg = UnifiedMessage::new(MessageType::CliDisconnected, Role::System);
                    self.broadcaster.broadcast(session, &msg).await;
                }
            }
            DomainEvent::ProcessSpawned { session_id, pid } => {
                if let Some(session) = self.get_live(&session_id).await {
                    session.lock().await.pid = Some(pid);
                }
                if let Err(e) = self.registry.set_pid(&session_id, pid).await {
                    warn!(session_id = %session_id, err = %e, "failed to persist spawned pid");
                }
            }
            DomainEvent::ProcessExited { session_id, exit_code, .. } => {
                if let Err(e) = self.registry.mark_exited(&session_id, exit_code).await {
                    debug!(session_id = %session_id, err = %e, "mark_exited on unknown session");
                }
            }
            _ => {}
        }
    }

    async fn get_live(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// `createSession` (spec.md §4.9).
    pub async fn create_session(&self, opts: CreateSessionOpts) -> BrokerResult<SessionInfo> {
        let adapter_name = opts.adapter_name.clone().unwrap_or_else(|| self.default_adapter.clone());
        let adapter = self
            .adapters
            .get(&adapter_name)
            .cloned()
            .ok_or_else(|| BrokerError::Other(anyhow::anyhow!("unknown adapter: {adapter_name}")))?;

        let id = crate::session::new_session_id();
        let mut session = Session::new(id.clone(), adapter_name.clone(), opts.cwd.clone());
        session.model = opts.model.clone();
        session.permission_mode = opts.permission_mode.clone();

        let info = SessionInfo::from(&session);
        self.registry.register(info.clone()).await?;

        let session = Arc::new(Mutex::new(session));
        self.sessions.write().await.insert(id.clone(), Arc::clone(&session));
        self.tracer.set_active_sessions(self.sessions.read().await.len() as i64);

        if self.no_auto_launch {
            return Ok(info);
        }

        let connect_opts = ConnectOptions { session_id: id.clone(), cwd: opts.cwd, resume: None, adapter_options: Value::Null };
        match self.lifecycle.connect_backend(Arc::clone(&session), adapter, connect_opts).await {
            Ok(()) => {
                self.registry.mark_connected(&id).await?;
                let guard = session.lock().await;
                Ok(SessionInfo::from(&*guard))
            }
            Err(e) => {
                // Roll back only if no process was ever created for this
                // session (spec.md §7): a spawned-then-failed inverted
                // session stays registered as `exited` instead.
                let pid = session.lock().await.pid;
                if pid.is_none() {
                    self.sessions.write().await.shift_remove(&id);
                    let _ = self.registry.remove_session(&id).await;
                } else {
                    let _ = self.registry.mark_exited(&id, Some(-1)).await;
                }
                Err(e)
            }
        }
    }

    /// `deleteSession` (spec.md §4.9).
    pub async fn delete_session(&self, id: &str) -> BrokerResult<()> {
        let session = self.get_live(id).await.ok_or_else(|| BrokerError::SessionNotFound(id.to_owned()))?;

        self.mediator.cancel_all(Arc::clone(&session)).await;
        let pid = session.lock().await.pid;
        self.lifecycle.disconnect_backend(Arc::clone(&session)).await;
        if let Some(pid) = pid {
            supervisor::kill_pid(pid, supervisor::DEFAULT_KILL_GRACE).await;
        }
        self.broadcaster.close_all(Arc::clone(&session)).await;

        self.sessions.write().await.shift_remove(id);
        self.tracer.set_active_sessions(self.sessions.read().await.len() as i64);
        self.registry.remove_session(id).await?;
        let _ = self.storage.remove_session(id).await;
        Ok(())
    }

    /// `routeInboundConsumerFrame` (spec.md §4.9): parse, enforce rate
    /// limit, enforce role, dispatch by type.
    pub async fn route_inbound_consumer_frame(&self, session: Arc<Mutex<Session>>, connection_id: &str, raw: &str) {
        if self.broadcaster.check_inbound_size(raw.len()).is_err() {
            self.broadcaster.reject_oversize(Arc::clone(&session), connection_id).await;
            return;
        }

        let msg: UnifiedMessage = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(_) => {
                self.reply_error(&session, connection_id, "malformed consumer frame", ErrorCode::Unknown).await;
                return;
            }
        };
        self.tracer.on_message(crate::tracer::Edge::ConsumerToCoordinator, &msg);

        let allowed = {
            let guard = session.lock().await;
            match guard.consumers.get(connection_id) {
                Some(consumer) => consumer.rate_limiter.try_consume(1.0).await,
                None => return,
            }
        };
        if !allowed {
            self.reply_error(&session, connection_id, "rate limit exceeded", ErrorCode::RateLimit).await;
            return;
        }

        let role = {
            let guard = session.lock().await;
            guard.consumers.get(connection_id).map(|c| c.role)
        };
        if role == Some(ConsumerRole::Observer) && is_mutating(msg.message_type) {
            self.reply_error(&session, connection_id, "observers cannot mutate session state", ErrorCode::Unknown).await;
            return;
        }

        self.dispatch_consumer_frame(session, connection_id, msg).await;
    }

    /// Transport-facing wrapper around [`Self::route_inbound_consumer_frame`]
    /// for callers (the WebSocket handler) that only hold a session id, not
    /// the live `Arc<Mutex<Session>>`. Returns `false` if the session is
    /// unknown so the caller can close the socket.
    pub async fn route_inbound_consumer_frame_by_id(&self, id: &str, connection_id: &str, raw: &str) -> bool {
        match self.get_live(id).await {
            Some(session) => {
                self.route_inbound_consumer_frame(session, connection_id, raw).await;
                true
            }
            None => false,
        }
    }

    async fn dispatch_consumer_frame(&self, session: Arc<Mutex<Session>>, connection_id: &str, msg: UnifiedMessage) {
        match msg.message_type {
            MessageType::UserMessage => self.handle_user_message(session, connection_id, msg).await,
            MessageType::PermissionResponse => self.handle_permission_response(session, connection_id, msg).await,
            MessageType::Interrupt => {
                if let Err(e) = self.lifecycle.send_to_backend(Arc::clone(&session), msg).await {
                    warn!(err = %e, "failed to forward interrupt");
                }
            }
            MessageType::ControlRequest if msg.meta_str("subtype") == Some("set_permission_mode") => {
                self.handle_set_permission_mode(session, msg).await;
            }
            MessageType::ControlRequest => {
                if let Err(e) = self.lifecycle.send_to_backend(Arc::clone(&session), msg).await {
                    warn!(err = %e, "failed to forward control_request");
                }
            }
            _ => {
                self.reply_error(&session, connection_id, "unsupported inbound frame type", ErrorCode::Unknown).await;
            }
        }
    }

    async fn handle_user_message(&self, session: Arc<Mutex<Session>>, connection_id: &str, msg: UnifiedMessage) {
        if let Some(text) = msg.content.iter().find_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        }) {
            if let Some(reply) = self.try_builtin_slash_command(&session, text).await {
                self.reply_to(&session, connection_id, &reply).await;
                return;
            }
        }

        {
            let mut guard = session.lock().await;
            guard.push_history(msg.clone());
        }
        let has_backend = session.lock().await.adapter_session.is_some();
        if has_backend {
            if let Err(e) = self.lifecycle.send_to_backend(Arc::clone(&session), msg).await {
                warn!(err = %e, "failed to forward user_message to backend");
            }
        } else {
            session.lock().await.pending_messages.push(msg);
        }
    }

    /// `/help` and `/status` are answered locally; every other frame
    /// (slash-prefixed or not) is forwarded as an ordinary `user_message`,
    /// relying on the vendor CLI's own slash-command handling (spec.md
    /// §4.9's "adapter slash executor" is not a separate hook on
    /// `BackendAdapterSession` in this implementation).
    async fn try_builtin_slash_command(&self, session: &Arc<Mutex<Session>>, text: &str) -> Option<UnifiedMessage> {
        let trimmed = text.trim();
        match trimmed {
            "/help" => Some(
                UnifiedMessage::new(MessageType::SlashCommandResult, Role::System)
                    .with_content(vec![ContentBlock::Text { text: "Available commands: /help, /status".into() }]),
            ),
            "/status" => {
                let guard = session.lock().await;
                let summary = format!(
                    "session {} | model={:?} | cost=${:.4} | turns={}",
                    guard.id, guard.state.model, guard.state.total_cost_usd, guard.state.num_turns
                );
                Some(UnifiedMessage::new(MessageType::SlashCommandResult, Role::System).with_content(vec![ContentBlock::Text { text: summary }]))
            }
            _ => None,
        }
    }

    async fn handle_permission_response(&self, session: Arc<Mutex<Session>>, connection_id: &str, msg: UnifiedMessage) {
        let Some(request_id) = msg.meta_str("request_id").map(str::to_owned) else {
            self.reply_error(&session, connection_id, "permission_response missing request_id", ErrorCode::Unknown).await;
            return;
        };
        let behavior = match msg.meta_str("behavior") {
            Some("allow") => Behavior::Allow,
            Some("deny") => Behavior::Deny,
            Some("always") => Behavior::Always,
            _ => {
                self.reply_error(&session, connection_id, "invalid permission behavior", ErrorCode::Unknown).await;
                return;
            }
        };
        let updated_input = msg.metadata.get("updated_input").cloned();

        if let Err(e) = self.mediator.resolve(session, &request_id, behavior, updated_input).await {
            // Unknown request id: drop with a debug log, not an error
            // reply (spec.md §7 "Permission mismatch").
            debug!(request_id, err = %e, "permission_response for unknown or already-resolved request");
        }
    }

    async fn handle_set_permission_mode(&self, session: Arc<Mutex<Session>>, msg: UnifiedMessage) {
        let has_backend = session.lock().await.adapter_session.is_some();
        if has_backend {
            if let Err(e) = self.lifecycle.send_to_backend(Arc::clone(&session), msg).await {
                warn!(err = %e, "failed to forward set_permission_mode control_request");
            }
        } else if let Some(mode) = msg.meta_str("permissionMode") {
            session.lock().await.permission_mode = Some(mode.to_owned());
        }
    }

    async fn reply_error(&self, session: &Arc<Mutex<Session>>, connection_id: &str, text: &str, code: ErrorCode) {
        let msg = UnifiedMessage::synthetic_error(text, code);
        self.reply_to(session, connection_id, &msg).await;
    }

    /// Send one message directly to a single attached consumer, used for
    /// synthetic errors and local slash-command replies that never touch
    /// the backend.
    async fn reply_to(&self, session: &Arc<Mutex<Session>>, connection_id: &str, msg: &UnifiedMessage) {
        let guard = session.lock().await;
        if let Some(consumer) = guard.consumers.get(connection_id) {
            if let Err(e) = self.broadcaster.send_to(consumer, msg).await {
                warn!(err = %e, "failed to deliver message to consumer");
            }
        }
    }

    /// Route one inbound `UnifiedMessage` produced by a backend adapter:
    /// reduce, persist, and fan out (spec.md §4.8, §4.9). This is the
    /// function wired into the lifecycle manager's [`RouteFn`].
    pub async fn route_unified_message(&self, session: Arc<Mutex<Session>>, msg: UnifiedMessage) {
        {
            let mut guard = session.lock().await;
            let next = reducer::apply(&guard.state, &mut guard.team_buffer, &msg);
            guard.state = next;
        }

        match msg.message_type {
            MessageType::PermissionRequest => {
                self.mediator.on_request(session, &msg).await;
                return;
            }
            MessageType::Error if is_backend_lost(&msg) => {
                // Cancel before the lifecycle manager's own disconnect path
                // clears pendingPermissions, so the broadcast still has
                // entries to cancel (spec.md §8 invariant #3, scenario d).
                self.mediator.cancel_all(Arc::clone(&session)).await;
            }
            _ => {}
        }

        {
            let mut guard = session.lock().await;
            guard.push_history(msg.clone());
        }
        let session_id = session.lock().await.id.clone();
        self.bus.publish(DomainEvent::Unified { session_id, message: msg.clone() });
        self.tracer.on_message(crate::tracer::Edge::BackendToConsumer, &msg);
        self.broadcaster.broadcast(Arc::clone(&session), &msg).await;
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.list_sessions().await
    }

    pub async fn get_session(&self, id: &str) -> Option<SessionInfo> {
        self.registry.get_session(id).await
    }

    pub async fn rename_session(&self, id: &str, name: String) -> BrokerResult<()> {
        self.registry.set_session_name(id, name.clone()).await?;
        if let Some(session) = self.get_live(id).await {
            session.lock().await.name = Some(name);
        }
        Ok(())
    }

    /// Fixed list of adapter kinds this build understands (spec.md §4.9
    /// `getSupportedModels`/`getSupportedCommands` query helpers); model
    /// lists are adapter-reported capability data and not modeled further
    /// here, consistent with §4.1's "capabilities differ enough that
    /// composition + helpers is cleaner" note.
    pub fn get_supported_commands(&self) -> Vec<&'static str> {
        vec!["/help", "/status"]
    }

    pub fn adapter_names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn lifecycle(&self) -> Arc<BackendLifecycleManager> {
        Arc::clone(&self.lifecycle)
    }

    pub fn broadcaster(&self) -> Arc<ConsumerBroadcaster> {
        Arc::clone(&self.broadcaster)
    }

    pub fn mediator(&self) -> Arc<crate::permission::PermissionMediator> {
        Arc::clone(&self.mediator)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn tracer(&self) -> Arc<crate::tracer::Tracer> {
        Arc::clone(&self.tracer)
    }

    pub async fn attach_consumer(&self, id: &str, consumer: crate::session::Consumer) -> BrokerResult<Vec<UnifiedMessage>> {
        let session = self.get_live(id).await.ok_or_else(|| BrokerError::SessionNotFound(id.to_owned()))?;
        let mut frames = self.broadcaster.attach(Arc::clone(&session), consumer).await;
        let replayed_ids: std::collections::HashSet<String> =
            frames.iter().filter(|f| f.message_type == MessageType::PermissionRequest).filter_map(|f| f.meta_str("request_id").map(str::to_owned)).collect();
        for pending in self.mediator.replay_pending(session).await {
            if pending.meta_str("request_id").is_some_and(|id| !replayed_ids.contains(id)) {
                frames.push(pending);
            }
        }
        self.tracer.set_active_consumers(self.total_consumer_count().await);
        Ok(frames)
    }

    pub async fn detach_consumer(&self, id: &str, connection_id: &str) {
        if let Some(session) = self.get_live(id).await {
            self.broadcaster.detach(session, connection_id).await;
        }
        self.tracer.set_active_consumers(self.total_consumer_count().await);
    }

    async fn total_consumer_count(&self) -> i64 {
        let sessions: Vec<Arc<Mutex<Session>>> = self.sessions.read().await.values().cloned().collect();
        let mut total = 0i64;
        for session in sessions {
            total += session.lock().await.consumers.len() as i64;
        }
        total
    }

    /// Point-in-time view for the [`RecoveryService`] (spec.md §4.10); it
    /// never touches `Session` fields directly.
    pub async fn recovery_snapshot(&self, id: &str) -> Option<RecoverySnapshot> {
        let session = self.get_live(id).await?;
        let guard = session.lock().await;
        Some(RecoverySnapshot {
            adapter_name: guard.adapter_name.clone(),
            cwd: guard.cwd.clone(),
            pid: guard.pid,
            backend_session_id: guard.backend_session_id.clone(),
            lifecycle_state: guard.lifecycle_state,
            archived: guard.archived,
            has_backend: guard.adapter_session.is_some(),
        })
    }

    /// Inverted-connection relaunch (spec.md §4.10 `relaunch()`): SIGTERM
    /// the old process, wait out the grace period, then spawn a fresh one
    /// with `--resume` via the adapter's normal `connect` path. If the new
    /// process exits within `resume_failure_threshold` the resume is
    /// considered to have failed and `backendSessionId` is cleared so the
    /// next attempt starts clean.
    pub async fn relaunch(self: &Arc<Self>, id: &str, grace: Duration, resume_failure_threshold: Duration) -> BrokerResult<()> {
        let session = self.get_live(id).await.ok_or_else(|| BrokerError::SessionNotFound(id.to_owned()))?;
        let (adapter_name, cwd, old_pid, resume) = {
            let guard = session.lock().await;
            (guard.adapter_name.clone(), guard.cwd.clone(), guard.pid, guard.backend_session_id.clone())
        };
        let adapter = self
            .adapters
            .get(&adapter_name)
            .cloned()
            .ok_or_else(|| BrokerError::Other(anyhow::anyhow!("unknown adapter: {adapter_name}")))?;

        if let Some(pid) = old_pid {
            supervisor::kill_pid(pid, grace).await;
        }

        let started = Instant::now();
        let opts = ConnectOptions { session_id: id.to_owned(), cwd, resume: resume.clone(), adapter_options: Value::Null };
        self.lifecycle.connect_backend(Arc::clone(&session), adapter, opts).await?;
        self.registry.mark_connected(id).await?;

        if resume.is_some() {
            self.spawn_resume_watch(id.to_owned(), started, resume_failure_threshold);
        }
        Ok(())
    }

    /// Direct-connect reconnect (spec.md §4.10 else-branch): no pid to
    /// signal, no `--resume` flag — just a fresh connect.
    pub async fn reconnect(&self, id: &str) -> BrokerResult<()> {
        let session = self.get_live(id).await.ok_or_else(|| BrokerError::SessionNotFound(id.to_owned()))?;
        let (adapter_name, cwd) = {
            let guard = session.lock().await;
            (guard.adapter_name.clone(), guard.cwd.clone())
        };
        let adapter = self
            .adapters
            .get(&adapter_name)
            .cloned()
            .ok_or_else(|| BrokerError::Other(anyhow::anyhow!("unknown adapter: {adapter_name}")))?;

        let opts = ConnectOptions { session_id: id.to_owned(), cwd, resume: None, adapter_options: Value::Null };
        self.lifecycle.connect_backend(Arc::clone(&session), adapter, opts).await?;
        self.registry.mark_connected(id).await
    }

    /// Watches for an early exit following a `--resume` relaunch. If the
    /// freshly spawned process dies before `threshold` elapses, the resume
    /// is treated as failed: `backendSessionId` is cleared and
    /// `ResumeFailed` is published so a future relaunch starts without
    /// `--resume` (spec.md §4.10 "resume failure detection").
    fn spawn_resume_watch(self: &Arc<Self>, session_id: String, started: Instant, threshold: Duration) {
        let this = Arc::clone(self);
        let mut events = this.bus.subscribe();
        tokio::spawn(async move {
            let deadline = threshold.saturating_sub(started.elapsed());
            let wait = tokio::time::sleep(deadline);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => return,
                    event = events.recv() => {
                        match event {
                            Ok(DomainEvent::ProcessExited { session_id: sid, .. }) if sid == session_id => {
                                if started.elapsed() < threshold {
                                    if let Some(session) = this.get_live(&session_id).await {
                                        session.lock().await.backend_session_id = None;
                                    }
                                    this.bus.publish(DomainEvent::ResumeFailed { session_id: session_id.clone() });
                                }
                                return;
                            }
                            Ok(_) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
