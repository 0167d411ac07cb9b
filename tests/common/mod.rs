//! Test utilities: in-memory app state and a scripted engine.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use ccsdk_gateway::api::{create_router, AppState};
use ccsdk_gateway::db::Database;
use ccsdk_gateway::engine::{
    EngineAdapter, EngineError, EngineEvent, EventStream, StreamOptions, TurnOutcome,
};
use ccsdk_gateway::hub::SessionHub;
use ccsdk_gateway::settings::GatewayConfig;
use ccsdk_gateway::store::SessionStore;

/// One scripted stream item: an event, or an engine failure message.
pub type ScriptItem = Result<EngineEvent, String>;

/// What the fake engine observed for one `stream` call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub prompt: String,
    pub resume_token: Option<String>,
}

/// Engine adapter that replays scripted turns and records its invocations.
///
/// Each `stream` call consumes the next script. An optional inter-event
/// delay makes cancellation mid-turn deterministic to test.
#[derive(Default)]
pub struct FakeEngine {
    scripts: Mutex<VecDeque<Vec<ScriptItem>>>,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Option<Duration>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Queue the script for the next turn.
    pub fn push_script(&self, script: Vec<ScriptItem>) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Every `stream` invocation seen so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl EngineAdapter for FakeEngine {
    fn stream(&self, prompt: String, options: StreamOptions) -> EventStream {
        self.calls.lock().unwrap().push(RecordedCall {
            prompt,
            resume_token: options.resume_token.clone(),
        });

        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let delay = self.delay;
        let cancel = options.cancel;
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            for item in script {
                if let Some(delay) = delay {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = tx.send(Err(EngineError::Cancelled)).await;
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                } else if cancel.is_cancelled() {
                    let _ = tx.send(Err(EngineError::Cancelled)).await;
                    return;
                }

                let item = item.map_err(EngineError::Failure);
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

/// Engine init event with the given resume token.
pub fn init_event(engine_session_id: &str) -> EngineEvent {
    EngineEvent::SystemInit {
        engine_session_id: engine_session_id.to_string(),
        model: Some("sonnet".to_string()),
        cwd: Some("/work".to_string()),
        tools: vec!["Bash".to_string(), "Read".to_string()],
        mcp_servers: Vec::new(),
        permission_mode: Some("default".to_string()),
    }
}

/// Successful terminal event.
pub fn result_event(text: &str) -> EngineEvent {
    EngineEvent::TurnResult {
        outcome: TurnOutcome::Success,
        total_cost_usd: Some(0.01),
        duration_ms: Some(5),
        result_text: Some(text.to_string()),
    }
}

/// A complete minimal turn: init, one assistant segment, success.
pub fn simple_turn(engine_session_id: &str, reply: &str) -> Vec<ScriptItem> {
    vec![
        Ok(init_event(engine_session_id)),
        Ok(EngineEvent::Assistant {
            text: reply.to_string(),
        }),
        Ok(result_event(reply)),
    ]
}

/// App state wired to an in-memory database and the given fake engine.
pub struct TestContext {
    pub state: AppState,
    pub engine: Arc<FakeEngine>,
}

pub async fn test_context_with(engine: FakeEngine, config: GatewayConfig) -> TestContext {
    let db = Database::in_memory().await.unwrap();
    let store = SessionStore::new(db.pool().clone());
    let engine = Arc::new(engine);
    let config = Arc::new(config);

    let hub = SessionHub::new(
        store.clone(),
        Arc::clone(&engine) as Arc<dyn EngineAdapter>,
        Arc::clone(&config),
    );
    let state = AppState::new(hub, store, Arc::clone(&engine) as Arc<dyn EngineAdapter>, config);

    TestContext { state, engine }
}

pub async fn test_context() -> TestContext {
    test_context_with(FakeEngine::new(), GatewayConfig::default()).await
}

/// Router over a fresh test context, for request-level tests.
pub async fn test_app() -> Router {
    let ctx = test_context().await;
    create_router(ctx.state)
}
