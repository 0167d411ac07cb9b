//! WebSocket message types.
//!
//! All frames are JSON text, tagged by `type` with camelCase field names.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hub::{GatewayError, SessionInfo};

// ============================================================================
// Commands (Client -> Server)
// ============================================================================

/// Commands sent by clients over WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    /// Submit a prompt, optionally targeting an existing session.
    Chat {
        content: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        new_conversation: bool,
    },

    /// Bind this client to a session's event stream.
    Subscribe { session_id: String },

    /// Detach from a session.
    Unsubscribe { session_id: String },

    /// Abort the session's in-flight turn.
    Cancel { session_id: String },

    /// Request a snapshot of in-memory sessions and client count.
    SystemInfo,
}

/// Decode an inbound text frame.
///
/// Valid JSON with an unrecognized `type` is distinguished from garbage so
/// the client gets the canonical "Unknown message type" reply.
pub fn decode_command(text: &str) -> Result<ClientCommand, GatewayError> {
    match serde_json::from_str::<ClientCommand>(text) {
        Ok(cmd) => Ok(cmd),
        Err(decode_err) => match serde_json::from_str::<Value>(text) {
            Ok(value) if value.get("type").and_then(Value::as_str).is_some() => {
                Err(GatewayError::BadRequest("Unknown message type".to_string()))
            }
            _ => Err(GatewayError::BadRequest(format!(
                "invalid frame: {}",
                decode_err
            ))),
        },
    }
}

// ============================================================================
// Events (Server -> Client)
// ============================================================================

/// Frames sent to clients over WebSocket.
///
/// Session-scoped events carry a `sessionId` so one connection can observe
/// several sessions over its lifetime.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Connection established; carries the in-memory session snapshots.
    Connected {
        message: String,
        available_sessions: Vec<SessionInfo>,
    },

    /// Snapshot of the session a client just subscribed to.
    SessionInfo { data: SessionInfo },

    /// Subscription acknowledged.
    Subscribed { session_id: String },

    /// Unsubscription acknowledged.
    Unsubscribed { session_id: String },

    /// One text segment of the assistant's reply.
    AssistantMessage {
        content: String,
        session_id: String,
    },

    /// The assistant invoked a tool.
    ToolUse {
        tool_name: String,
        tool_id: String,
        tool_input: Value,
        session_id: String,
    },

    /// A tool finished.
    ToolResult {
        tool_use_id: String,
        content: Option<String>,
        is_error: bool,
        session_id: String,
    },

    /// Engine system event (e.g. `init`).
    System {
        subtype: String,
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// Terminal turn result.
    Result {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        session_id: String,
    },

    /// Abort requested; the turn is winding down.
    Cancelling { session_id: String, message: String },

    /// The turn stopped before completing.
    Cancelled { session_id: String, message: String },

    /// Error reply; `sessionId` present when scoped to a session.
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Reply to a `system_info` request.
    SystemInfo {
        sessions: Vec<SessionInfo>,
        client_count: usize,
    },
}
