//! Store data models.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::collections::HashMap;

/// Message type within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Assistant,
    System,
    ToolUse,
    ToolResult,
    Result,
    Error,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::User => "user",
            MessageType::Assistant => "assistant",
            MessageType::System => "system",
            MessageType::ToolUse => "tool_use",
            MessageType::ToolResult => "tool_result",
            MessageType::Result => "result",
            MessageType::Error => "error",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageType::User),
            "assistant" => Ok(MessageType::Assistant),
            "system" => Ok(MessageType::System),
            "tool_use" => Ok(MessageType::ToolUse),
            "tool_result" => Ok(MessageType::ToolResult),
            "result" => Ok(MessageType::Result),
            "error" => Ok(MessageType::Error),
            _ => Err(format!("unknown message type: {}", s)),
        }
    }
}

impl TryFrom<String> for MessageType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Durable record of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Opaque session id, unique per hub.
    pub id: String,
    /// Resume token returned by the engine on the first turn.
    pub engine_session_id: Option<String>,
    /// Epoch ms.
    pub created_at: i64,
    /// Epoch ms.
    pub last_activity: i64,
    /// Number of persisted messages for this session.
    pub message_count: i64,
    /// True while a turn is in flight.
    pub is_active: bool,
    /// Opaque JSON metadata.
    pub metadata: Option<String>,
}

/// One persisted event within a session.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: i64,
    pub session_id: String,
    #[sqlx(rename = "type", try_from = "String")]
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub subtype: Option<String>,
    pub content: Option<String>,
    /// Epoch ms.
    pub timestamp: i64,
    /// Present on `result` rows only.
    pub cost: Option<f64>,
    /// Duration in ms, present on `result` rows only.
    pub duration: Option<i64>,
    pub metadata: Option<String>,
}

/// Fields for appending a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: String,
    pub message_type: MessageType,
    pub subtype: Option<String>,
    pub content: Option<String>,
    pub timestamp: i64,
    pub cost: Option<f64>,
    pub duration: Option<i64>,
    pub metadata: Option<Value>,
}

impl NewMessage {
    /// A message with only the required fields set.
    pub fn new(session_id: impl Into<String>, message_type: MessageType, timestamp: i64) -> Self {
        Self {
            session_id: session_id.into(),
            message_type,
            subtype: None,
            content: None,
            timestamp,
            cost: None,
            duration: None,
            metadata: None,
        }
    }

    pub fn subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn cost(mut self, cost: Option<f64>) -> Self {
        self.cost = cost;
        self
    }

    pub fn duration(mut self, duration: Option<i64>) -> Self {
        self.duration = duration;
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Partial update of a session row.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub engine_session_id: Option<String>,
    pub last_activity: Option<i64>,
    pub message_count: Option<i64>,
    pub is_active: Option<bool>,
    pub metadata: Option<Value>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self.engine_session_id.is_none()
            && self.last_activity.is_none()
            && self.message_count.is_none()
            && self.is_active.is_none()
            && self.metadata.is_none()
    }
}

/// An attached WebSocket connection.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    pub id: String,
    /// Epoch ms.
    pub connected_at: i64,
    /// Epoch ms; null while attached.
    pub disconnected_at: Option<i64>,
    /// Session this client is subscribed to, at most one.
    pub current_session_id: Option<String>,
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_sessions: i64,
    pub active_sessions: i64,
    pub total_messages: i64,
    /// Sum over all non-null `cost` values.
    pub total_cost: f64,
    pub messages_by_type: HashMap<String, i64>,
}
