//! Gateway error taxonomy.

use thiserror::Error;

use crate::engine::EngineError;

/// Errors surfaced by the hub and its sessions.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed frame or missing field.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unknown session.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Prompt queue is full.
    #[error("prompt queue is full")]
    Backpressure,

    /// An abort was observed.
    #[error("turn cancelled")]
    Cancelled,

    /// The engine adapter raised.
    #[error("engine failure: {0}")]
    Engine(#[from] EngineError),

    /// Persistence failed.
    #[error("store failure: {0}")]
    Store(String),

    /// The session was reclaimed.
    #[error("session is gone")]
    Gone,

    /// Everything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Wrap a store error, preserving its context chain.
    pub fn store(err: anyhow::Error) -> Self {
        GatewayError::Store(format!("{:#}", err))
    }
}
