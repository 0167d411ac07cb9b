//! Process-wide session registry.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::info;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::engine::EngineAdapter;
use crate::settings::GatewayConfig;
use crate::store::{now_ms, SessionStore};

use super::error::GatewayError;
use super::session::{ChatSession, SessionInfo};

/// Registry of in-memory sessions plus connected-client bookkeeping.
pub struct SessionHub {
    sessions: DashMap<String, Arc<ChatSession>>,
    /// Connected WebSocket client ids.
    clients: DashMap<String, ()>,
    store: SessionStore,
    engine: Arc<dyn EngineAdapter>,
    config: Arc<GatewayConfig>,
}

impl SessionHub {
    pub fn new(
        store: SessionStore,
        engine: Arc<dyn EngineAdapter>,
        config: Arc<GatewayConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            clients: DashMap::new(),
            store,
            engine,
            config,
        })
    }

    /// Look up a session without creating it.
    pub fn get(&self, session_id: &str) -> Option<Arc<ChatSession>> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    /// Return the session named by `session_id`, creating it if unknown.
    ///
    /// A persisted row for the id is rehydrated (resume token and message
    /// counter survive reclamation); otherwise a fresh row is written.
    /// Creation is race-free: concurrent calls for one id yield one session.
    pub async fn get_or_create(
        &self,
        session_id: Option<&str>,
    ) -> Result<Arc<ChatSession>, GatewayError> {
        if let Some(id) = session_id {
            if let Some(session) = self.get(id) {
                return Ok(session);
            }
        }

        let id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = now_ms();

        // Persist (or rehydrate from) the session row before registering.
        let existing = self
            .store
            .get_session(&id)
            .await
            .map_err(GatewayError::store)?;

        let (created_at, resume) = match existing {
            Some(record) => (
                record.created_at,
                Some((record.engine_session_id, record.message_count)),
            ),
            None => {
                self.store
                    .create_session(&id, now, None)
                    .await
                    .map_err(GatewayError::store)?;
                (now, None)
            }
        };

        let session = ChatSession::spawn(
            id.clone(),
            created_at,
            resume,
            self.store.clone(),
            Arc::clone(&self.engine),
            Arc::clone(&self.config),
        );

        match self.sessions.entry(id.clone()) {
            Entry::Occupied(entry) => {
                // Lost the creation race; discard our runner.
                session.abort_runner();
                Ok(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                info!("Created session {}", id);
                entry.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    /// Snapshots of every in-memory session.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<ChatSession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos
    }

    /// Number of in-memory sessions with a turn in flight.
    pub async fn active_session_count(&self) -> usize {
        let mut count = 0;
        let sessions: Vec<Arc<ChatSession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            if !session.is_idle().await {
                count += 1;
            }
        }
        count
    }

    /// Record a newly connected WebSocket client.
    pub fn client_connected(&self, client_id: &str) {
        self.clients.insert(client_id.to_string(), ());
    }

    /// Number of live WebSocket clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Handle a client disconnect: unsubscribe it from its session (if any)
    /// and schedule an idle check there.
    pub fn on_client_disconnect(self: &Arc<Self>, client_id: &str, session_id: Option<&str>) {
        self.clients.remove(client_id);

        if let Some(session_id) = session_id {
            if let Some(session) = self.get(session_id) {
                session.unsubscribe(client_id);
                self.schedule_idle_check(session_id);
            }
        }
    }

    /// After the grace period, reclaim the session if it still has no
    /// subscribers and no turn in flight. A subscribe during the window
    /// bumps the session's epoch and aborts this check.
    pub fn schedule_idle_check(self: &Arc<Self>, session_id: &str) {
        let hub = Arc::clone(self);
        let id = session_id.to_string();
        let grace = Duration::from_millis(self.config.idle_grace_ms);

        tokio::spawn(async move {
            let Some(session) = hub.get(&id) else {
                return;
            };
            let epoch = session.epoch().await;

            tokio::time::sleep(grace).await;

            let Some(session) = hub.get(&id) else {
                return;
            };
            if session.subscriber_count() == 0
                && session.is_idle().await
                && session.epoch().await == epoch
            {
                info!("Reclaiming idle session {}", id);
                session.cleanup().await;
                hub.sessions.remove(&id);
            }
        });
    }

    /// Cancel every running turn, close the queues and let in-flight
    /// persistence drain.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<ChatSession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        if sessions.is_empty() {
            info!("No sessions to shut down");
            return;
        }

        info!("Shutting down {} session(s)...", sessions.len());
        for session in sessions {
            let id = session.id().to_string();
            session.cleanup().await;
            self.sessions.remove(&id);
            info!("Stopped session {}", id);
        }
    }

    /// Drop a session from the registry without cleanup. Used by tests and
    /// the REST delete path after the row is gone.
    pub fn evict(&self, session_id: &str) -> Option<Arc<ChatSession>> {
        self.sessions
            .remove(session_id)
            .map(|(_, session)| session)
    }
}

impl std::fmt::Debug for SessionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHub")
            .field("sessions", &self.sessions.len())
            .field("clients", &self.clients.len())
            .finish()
    }
}
