//! Engine adapter contract: stream options, event taxonomy and errors.

use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// A lazily produced, finite sequence of engine events for one turn.
pub type EventStream = Pin<Box<dyn Stream<Item = EngineResult<EngineEvent>> + Send>>;

/// Errors that can occur while streaming a turn.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The cancellation token fired before the turn finished.
    #[error("turn cancelled")]
    Cancelled,

    /// The engine process could not be started.
    #[error("failed to spawn engine: {0}")]
    Spawn(#[from] std::io::Error),

    /// The engine produced output that could not be decoded.
    #[error("failed to decode engine output: {0}")]
    Decode(#[from] serde_json::Error),

    /// The engine reported a failure or exited abnormally.
    #[error("engine failure: {0}")]
    Failure(String),
}

/// Permission mode forwarded to the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl PermissionMode {
    /// The engine CLI flag value for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::Plan => "plan",
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(PermissionMode::Default),
            "acceptEdits" => Ok(PermissionMode::AcceptEdits),
            "bypassPermissions" => Ok(PermissionMode::BypassPermissions),
            "plan" => Ok(PermissionMode::Plan),
            _ => Err(format!("unknown permission mode: {}", s)),
        }
    }
}

/// Options for a single streamed turn.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Resume token from a previous turn of the same conversation.
    pub resume_token: Option<String>,
    /// Cancellation token; when triggered the stream terminates promptly.
    pub cancel: CancellationToken,
    /// Model name understood by the engine.
    pub model: String,
    /// Maximum agent turns per prompt.
    pub max_turns: u32,
    /// Working directory for the engine.
    pub cwd: PathBuf,
    /// Restrict the engine to these tools, if set.
    pub allowed_tools: Option<Vec<String>>,
    /// Text appended to the engine's system prompt.
    pub system_prompt_suffix: Option<String>,
    /// Permission mode for tool execution.
    pub permission_mode: PermissionMode,
    /// MCP server definitions forwarded to the engine.
    pub mcp_servers: Option<HashMap<String, Value>>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            resume_token: None,
            cancel: CancellationToken::new(),
            model: "sonnet".to_string(),
            max_turns: 100,
            cwd: PathBuf::from("."),
            allowed_tools: None,
            system_prompt_suffix: None,
            permission_mode: PermissionMode::Default,
            mcp_servers: None,
        }
    }
}

/// Terminal outcome of a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Success,
    /// Engine-reported error subtype, e.g. `error_max_turns`.
    Error(String),
}

impl TurnOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TurnOutcome::Success)
    }

    /// The persisted subtype string for this outcome.
    pub fn as_subtype(&self) -> &str {
        match self {
            TurnOutcome::Success => "success",
            TurnOutcome::Error(subtype) => subtype,
        }
    }
}

/// Normalized events emitted by the engine during a turn.
///
/// Implementations map the underlying engine's payloads onto these shapes;
/// unknown payloads are dropped with a logged warning.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// First event of a turn; carries the resume token and engine config.
    SystemInit {
        engine_session_id: String,
        model: Option<String>,
        cwd: Option<String>,
        tools: Vec<String>,
        mcp_servers: Vec<Value>,
        permission_mode: Option<String>,
    },
    /// One text segment of the assistant's reply.
    Assistant { text: String },
    /// The assistant invoked a tool.
    ToolUse {
        tool_name: String,
        tool_id: String,
        tool_input: Value,
    },
    /// A tool finished and returned output.
    ToolResult {
        tool_use_id: String,
        content: Option<String>,
        is_error: bool,
    },
    /// Echo of the user's prompt; absorbed by the session.
    UserEcho { content: String },
    /// Exactly one per turn, terminal.
    TurnResult {
        outcome: TurnOutcome,
        total_cost_usd: Option<f64>,
        duration_ms: Option<i64>,
        result_text: Option<String>,
    },
}

/// Contract for streaming one turn against the engine.
///
/// The adapter must not retry silently: failures surface as stream items and
/// a triggered cancellation token terminates the stream with
/// [`EngineError::Cancelled`].
pub trait EngineAdapter: Send + Sync {
    /// Start a streaming turn for `prompt` under `options`.
    fn stream(&self, prompt: String, options: StreamOptions) -> EventStream;
}
