//! Application state shared across handlers.

use std::sync::Arc;

use crate::engine::EngineAdapter;
use crate::hub::SessionHub;
use crate::settings::GatewayConfig;
use crate::store::SessionStore;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Registry of in-memory sessions.
    pub hub: Arc<SessionHub>,
    /// Persistence store behind the `/db` surface.
    pub store: SessionStore,
    /// Engine adapter, used directly for one-shot queries.
    pub engine: Arc<dyn EngineAdapter>,
    /// Effective gateway configuration.
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    pub fn new(
        hub: Arc<SessionHub>,
        store: SessionStore,
        engine: Arc<dyn EngineAdapter>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            hub,
            store,
            engine,
            config,
        }
    }
}
