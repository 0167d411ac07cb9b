//! Per-session state machine and turn runner.
//!
//! Each session owns a prompt queue, a subscriber set and a single turn
//! runner task. The runner is the only place that mutates turn state (resume
//! token, abort handle, active flag); external callers post messages: they
//! enqueue prompts, trigger the abort token, or mutate the subscriber map.

use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::{EngineAdapter, EngineError, EngineEvent};
use crate::settings::GatewayConfig;
use crate::store::{now_ms, MessageType, NewMessage, SessionPatch, SessionStore};
use crate::ws::ServerEvent;

use super::error::GatewayError;
use super::queue::{prompt_queue, PromptQueue};

/// A handle for delivering frames to one subscribed client.
pub type SubscriberSender = mpsc::Sender<ServerEvent>;

/// Snapshot of a session's in-memory state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub message_count: i64,
    pub is_active: bool,
    /// Epoch ms.
    pub created_at: i64,
    /// Epoch ms.
    pub last_activity: i64,
}

/// Mutable session state, guarded by one lock.
struct SessionState {
    /// Resume token captured from the engine's init event.
    engine_session_id: Option<String>,
    /// Abort handle for the in-flight turn, if any.
    abort: Option<CancellationToken>,
    is_active: bool,
    message_count: i64,
    last_activity: i64,
    /// Set by cleanup; submissions fail with `Gone` afterwards.
    closed: bool,
    /// Bumped on every subscribe; lets pending idle checks detect
    /// re-subscription during the grace window.
    epoch: u64,
}

/// One conversation: queue, subscribers, turn runner.
pub struct ChatSession {
    id: String,
    created_at: i64,
    store: SessionStore,
    engine: Arc<dyn EngineAdapter>,
    config: Arc<GatewayConfig>,
    queue: PromptQueue,
    subscribers: DashMap<String, SubscriberSender>,
    state: Mutex<SessionState>,
    /// Stops the runner loop between turns.
    shutdown: CancellationToken,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    /// Create the session and spawn its turn runner.
    ///
    /// `resume` carries state hydrated from a persisted row when an
    /// id is re-referenced after reclamation.
    pub fn spawn(
        id: String,
        created_at: i64,
        resume: Option<(Option<String>, i64)>,
        store: SessionStore,
        engine: Arc<dyn EngineAdapter>,
        config: Arc<GatewayConfig>,
    ) -> Arc<Self> {
        let (queue, rx) = prompt_queue(config.queue_capacity);
        let (engine_session_id, message_count) = resume.unwrap_or((None, 0));

        let session = Arc::new(Self {
            id,
            created_at,
            store,
            engine,
            config,
            queue,
            subscribers: DashMap::new(),
            state: Mutex::new(SessionState {
                engine_session_id,
                abort: None,
                is_active: false,
                message_count,
                last_activity: created_at,
                closed: false,
                epoch: 0,
            }),
            shutdown: CancellationToken::new(),
            runner: Mutex::new(None),
        });

        let handle = tokio::spawn(Arc::clone(&session).run(rx));
        *session
            .runner
            .try_lock()
            .expect("runner slot is uncontended at construction") = Some(handle);

        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub async fn is_idle(&self) -> bool {
        !self.state.lock().await.is_active
    }

    pub async fn epoch(&self) -> u64 {
        self.state.lock().await.epoch
    }

    /// Snapshot for `session_info` frames and the REST surface.
    pub async fn info(&self) -> SessionInfo {
        let state = self.state.lock().await;
        SessionInfo {
            id: self.id.clone(),
            message_count: state.message_count,
            is_active: state.is_active,
            created_at: self.created_at,
            last_activity: state.last_activity,
        }
    }

    /// Enqueue a prompt; the turn runner picks it up in arrival order.
    ///
    /// The `user` message is persisted at submit time, before the prompt is
    /// enqueued, so it precedes the turn's own rows; engine echoes of the
    /// prompt are never persisted, keeping `message_count` aligned with the
    /// message rows.
    pub async fn submit(&self, content: &str) -> Result<(), GatewayError> {
        if self.state.lock().await.closed {
            return Err(GatewayError::Gone);
        }

        let ts = now_ms();
        match self
            .store
            .append_message(NewMessage::new(&self.id, MessageType::User, ts).content(content))
            .await
        {
            Ok(_) => {
                let mut state = self.state.lock().await;
                state.message_count += 1;
                state.last_activity = ts;
            }
            Err(e) => warn!(
                "Failed to persist user message for session {}: {:#}",
                self.id, e
            ),
        }

        self.queue.push(content.to_string())
    }

    /// Attach a client. Idempotent: a client that is already subscribed
    /// keeps its slot and receives no duplicate snapshot.
    pub async fn subscribe(&self, client_id: &str, tx: SubscriberSender) {
        let already = self
            .subscribers
            .insert(client_id.to_string(), tx.clone())
            .is_some();

        {
            let mut state = self.state.lock().await;
            state.epoch += 1;
        }

        if already {
            debug!(
                "Client {} re-subscribed to session {}",
                client_id, self.id
            );
            return;
        }

        info!("Client {} subscribed to session {}", client_id, self.id);
        let info = self.info().await;
        if tx.try_send(ServerEvent::SessionInfo { data: info }).is_err() {
            warn!(
                "Failed to deliver session snapshot to client {}",
                client_id
            );
        }
    }

    /// Detach a client. Reclamation eligibility is the hub's concern.
    pub fn unsubscribe(&self, client_id: &str) {
        if self.subscribers.remove(client_id).is_some() {
            info!(
                "Client {} unsubscribed from session {}",
                client_id, self.id
            );
        }
    }

    /// Signal the in-flight turn to abort. No-op while idle.
    pub async fn cancel(&self) {
        let token = self.state.lock().await.abort.clone();
        let Some(token) = token else {
            debug!("Cancel on idle session {} ignored", self.id);
            return;
        };

        self.broadcast(ServerEvent::Cancelling {
            session_id: self.id.clone(),
            message: "Cancelling current operation".to_string(),
        })
        .await;
        token.cancel();
    }

    /// Abort any running turn and forget the engine conversation, keeping
    /// persisted history intact. The next submit starts a fresh exchange.
    pub async fn end_conversation(&self) {
        {
            let mut state = self.state.lock().await;
            if let Some(token) = state.abort.take() {
                token.cancel();
            }
            state.engine_session_id = None;
            state.message_count = 0;
            state.is_active = false;
        }

        if let Err(e) = self
            .store
            .update_session(
                &self.id,
                SessionPatch {
                    is_active: Some(false),
                    last_activity: Some(now_ms()),
                    ..SessionPatch::default()
                },
            )
            .await
        {
            warn!("Failed to persist conversation end for {}: {:#}", self.id, e);
        }

        info!("Session {} conversation ended", self.id);
    }

    /// Tear the session down: abort, stop the runner, drop subscribers and
    /// persist the idle state. Submissions fail with `Gone` afterwards.
    pub async fn cleanup(&self) {
        {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.is_active = false;
            if let Some(token) = state.abort.take() {
                token.cancel();
            }
        }

        self.shutdown.cancel();
        if let Some(handle) = self.runner.lock().await.take() {
            // The runner finishes its current turn finalization, then exits.
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Session {} runner ended abnormally: {}", self.id, e);
                }
            }
        }

        self.subscribers.clear();

        if let Err(e) = self
            .store
            .update_session(
                &self.id,
                SessionPatch {
                    is_active: Some(false),
                    last_activity: Some(now_ms()),
                    ..SessionPatch::default()
                },
            )
            .await
        {
            warn!("Failed to persist cleanup for {}: {:#}", self.id, e);
        }

        info!("Session {} cleaned up", self.id);
    }

    /// Stop the runner without touching persisted state. Used when a racing
    /// creation loses and its freshly spawned session is discarded.
    pub(crate) fn abort_runner(&self) {
        self.shutdown.cancel();
    }

    /// Runner loop: one turn at a time, in queue order.
    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                prompt = rx.recv() => match prompt {
                    Some(prompt) => self.run_turn(prompt).await,
                    None => break,
                },
            }
        }
        debug!("Session {} runner exited", self.id);
    }

    /// Drive one turn: stream engine events, persisting and fanning out each
    /// in order, then return the session to idle.
    async fn run_turn(&self, prompt: String) {
        let started = now_ms();
        let cancel = CancellationToken::new();

        let resume_token = {
            let mut state = self.state.lock().await;
            state.abort = Some(cancel.clone());
            state.is_active = true;
            state.last_activity = started;
            state.engine_session_id.clone()
        };

        if let Err(e) = self
            .store
            .update_session(
                &self.id,
                SessionPatch {
                    is_active: Some(true),
                    last_activity: Some(started),
                    ..SessionPatch::default()
                },
            )
            .await
        {
            warn!("Failed to mark session {} active: {:#}", self.id, e);
        }

        let mut options = self.config.stream_options();
        options.resume_token = resume_token;
        options.cancel = cancel;

        info!(
            "Session {} starting turn (resume={})",
            self.id,
            options.resume_token.is_some()
        );

        let mut stream = self.engine.stream(prompt, options);
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    let terminal = matches!(event, EngineEvent::TurnResult { .. });
                    self.handle_event(event).await;
                    if terminal {
                        break;
                    }
                }
                Err(EngineError::Cancelled) => {
                    info!("Session {} turn cancelled", self.id);
                    self.broadcast(ServerEvent::Cancelled {
                        session_id: self.id.clone(),
                        message: "Operation cancelled".to_string(),
                    })
                    .await;
                    break;
                }
                Err(e) => {
                    warn!("Session {} engine failure: {}", self.id, e);
                    let message = e.to_string();
                    self.persist(
                        NewMessage::new(&self.id, MessageType::Error, now_ms())
                            .content(message.clone()),
                    )
                    .await;
                    self.broadcast(ServerEvent::Error {
                        error: message,
                        session_id: Some(self.id.clone()),
                    })
                    .await;
                    break;
                }
            }
        }

        let finished = now_ms();
        {
            let mut state = self.state.lock().await;
            state.abort = None;
            state.is_active = false;
            state.last_activity = finished;
        }

        if let Err(e) = self
            .store
            .update_session(
                &self.id,
                SessionPatch {
                    is_active: Some(false),
                    last_activity: Some(finished),
                    ..SessionPatch::default()
                },
            )
            .await
        {
            warn!("Failed to mark session {} idle: {:#}", self.id, e);
        }
    }

    /// Map an engine event to its wire frame and message row, in the
    /// required order: persist first, then fan out. A failed write is logged
    /// and must not block delivery.
    async fn handle_event(&self, event: EngineEvent) {
        let ts = now_ms();
        match event {
            EngineEvent::SystemInit {
                engine_session_id,
                model,
                cwd,
                tools,
                mcp_servers,
                permission_mode,
            } => {
                {
                    let mut state = self.state.lock().await;
                    state.engine_session_id = Some(engine_session_id.clone());
                }
                if let Err(e) = self
                    .store
                    .update_session(
                        &self.id,
                        SessionPatch {
                            engine_session_id: Some(engine_session_id),
                            ..SessionPatch::default()
                        },
                    )
                    .await
                {
                    warn!(
                        "Failed to persist engine session id for {}: {:#}",
                        self.id, e
                    );
                }

                let data = json!({
                    "model": model,
                    "cwd": cwd,
                    "tools": tools,
                    "mcpServers": mcp_servers,
                    "permissionMode": permission_mode,
                });
                self.persist(
                    NewMessage::new(&self.id, MessageType::System, ts)
                        .subtype("init")
                        .metadata(data.clone()),
                )
                .await;
                self.broadcast(ServerEvent::System {
                    subtype: "init".to_string(),
                    session_id: self.id.clone(),
                    data: Some(data),
                })
                .await;
            }

            EngineEvent::Assistant { text } => {
                self.persist(
                    NewMessage::new(&self.id, MessageType::Assistant, ts)
                        .subtype("text")
                        .content(text.clone()),
                )
                .await;
                self.broadcast(ServerEvent::AssistantMessage {
                    content: text,
                    session_id: self.id.clone(),
                })
                .await;
            }

            EngineEvent::ToolUse {
                tool_name,
                tool_id,
                tool_input,
            } => {
                self.persist(
                    NewMessage::new(&self.id, MessageType::ToolUse, ts)
                        .subtype(tool_name.clone())
                        .metadata(json!({
                            "toolId": tool_id,
                            "toolInput": tool_input,
                        })),
                )
                .await;
                self.broadcast(ServerEvent::ToolUse {
                    tool_name,
                    tool_id,
                    tool_input,
                    session_id: self.id.clone(),
                })
                .await;
            }

            EngineEvent::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let mut row = NewMessage::new(&self.id, MessageType::ToolResult, ts).metadata(
                    json!({
                        "toolUseId": tool_use_id,
                        "isError": is_error,
                    }),
                );
                if let Some(ref text) = content {
                    row = row.content(text.clone());
                }
                self.persist(row).await;
                self.broadcast(ServerEvent::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                    session_id: self.id.clone(),
                })
                .await;
            }

            // Prompt echoes are absorbed: the user row was written at submit.
            EngineEvent::UserEcho { .. } => {}

            EngineEvent::TurnResult {
                outcome,
                total_cost_usd,
                duration_ms,
                result_text,
            } => {
                let mut row = NewMessage::new(&self.id, MessageType::Result, ts)
                    .subtype(outcome.as_subtype())
                    .cost(total_cost_usd)
                    .duration(duration_ms);
                if let Some(ref text) = result_text {
                    row = row.content(text.clone());
                }
                self.persist(row).await;

                let success = outcome.is_success();
                self.broadcast(ServerEvent::Result {
                    success,
                    result: result_text,
                    cost: total_cost_usd,
                    duration: duration_ms,
                    error: if success {
                        None
                    } else {
                        Some(outcome.as_subtype().to_string())
                    },
                    session_id: self.id.clone(),
                })
                .await;
            }
        }
    }

    /// Append a message row, logging failures instead of propagating them.
    async fn persist(&self, message: NewMessage) {
        let ts = message.timestamp;
        match self.store.append_message(message).await {
            Ok(_) => {
                let mut state = self.state.lock().await;
                state.message_count += 1;
                state.last_activity = ts;
            }
            Err(e) => warn!("Failed to persist message for {}: {:#}", self.id, e),
        }
    }

    /// Deliver a frame to every subscriber. A client whose buffer is full or
    /// whose connection is gone is dropped from the set; others are
    /// unaffected.
    async fn broadcast(&self, event: ServerEvent) {
        let targets: Vec<(String, SubscriberSender)> = self
            .subscribers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (client_id, tx) in targets {
            if tx.try_send(event.clone()).is_err() {
                warn!(
                    "Dropping subscriber {} from session {} (slow or disconnected)",
                    client_id, self.id
                );
                self.subscribers.remove(&client_id);
            }
        }
    }
}
