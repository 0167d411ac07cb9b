//! Bounded per-session prompt queue.
//!
//! One producer side shared by the WebSocket decoders, one consumer (the
//! session's turn runner). A full queue fails fast instead of buffering
//! unboundedly.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::error::GatewayError;

/// Producer half of a session's prompt queue.
#[derive(Debug, Clone)]
pub struct PromptQueue {
    tx: mpsc::Sender<String>,
}

/// Create a prompt queue with the given capacity (at least 1).
pub fn prompt_queue(capacity: usize) -> (PromptQueue, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PromptQueue { tx }, rx)
}

impl PromptQueue {
    /// Enqueue a prompt without blocking.
    pub fn push(&self, prompt: String) -> Result<(), GatewayError> {
        self.tx.try_send(prompt).map_err(|e| match e {
            TrySendError::Full(_) => GatewayError::Backpressure,
            TrySendError::Closed(_) => GatewayError::Gone,
        })
    }
}
