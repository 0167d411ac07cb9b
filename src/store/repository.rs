//! Repository over the gateway database.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;

use super::models::{
    ClientRecord, MessageRecord, NewMessage, SessionPatch, SessionRecord, StoreStats,
};

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Typed repository for sessions, messages and clients.
#[derive(Debug, Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Create a new store over the given pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========== Session Operations ==========

    /// Insert a new session row, active with zero messages. Idempotent so
    /// that racing creations of one id cannot fail each other.
    pub async fn create_session(
        &self,
        id: &str,
        created_at: i64,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, created_at, last_activity, message_count, is_active, metadata)
            VALUES (?, ?, ?, 0, 1, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(created_at)
        .bind(created_at)
        .bind(metadata.map(|m| m.to_string()))
        .execute(&self.pool)
        .await
        .context("creating session")?;

        Ok(())
    }

    /// Get a session by id.
    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT id, engine_session_id, created_at, last_activity, message_count, is_active, metadata
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")
    }

    /// List sessions ordered by most recent activity.
    pub async fn list_sessions(&self, limit: i64, offset: i64) -> Result<Vec<SessionRecord>> {
        sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT id, engine_session_id, created_at, last_activity, message_count, is_active, metadata
            FROM sessions
            ORDER BY last_activity DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("listing sessions")
    }

    /// List sessions with a turn in flight.
    pub async fn list_active_sessions(&self) -> Result<Vec<SessionRecord>> {
        sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT id, engine_session_id, created_at, last_activity, message_count, is_active, metadata
            FROM sessions
            WHERE is_active = 1
            ORDER BY last_activity DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing active sessions")
    }

    /// Apply a partial update to a session row.
    pub async fn update_session(&self, id: &str, patch: SessionPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut sets = Vec::new();
        if patch.engine_session_id.is_some() {
            sets.push("engine_session_id = ?");
        }
        if patch.last_activity.is_some() {
            sets.push("last_activity = ?");
        }
        if patch.message_count.is_some() {
            sets.push("message_count = ?");
        }
        if patch.is_active.is_some() {
            sets.push("is_active = ?");
        }
        if patch.metadata.is_some() {
            sets.push("metadata = ?");
        }

        let sql = format!("UPDATE sessions SET {} WHERE id = ?", sets.join(", "));
        let mut query = sqlx::query(&sql);
        if let Some(ref engine_session_id) = patch.engine_session_id {
            query = query.bind(engine_session_id);
        }
        if let Some(last_activity) = patch.last_activity {
            query = query.bind(last_activity);
        }
        if let Some(message_count) = patch.message_count {
            query = query.bind(message_count);
        }
        if let Some(is_active) = patch.is_active {
            query = query.bind(is_active);
        }
        if let Some(ref metadata) = patch.metadata {
            query = query.bind(metadata.to_string());
        }

        query
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session")?;

        Ok(())
    }

    /// Delete a session; messages cascade. Returns false if the id is unknown.
    pub async fn delete_session(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete inactive sessions whose last activity is older than `days`.
    /// Returns the number of deleted rows.
    pub async fn cleanup_old_sessions(&self, days: i64, now: i64) -> Result<i64> {
        let cutoff = now - days.saturating_mul(MS_PER_DAY);
        let result = sqlx::query("DELETE FROM sessions WHERE is_active = 0 AND last_activity < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("cleaning up old sessions")?;

        Ok(result.rows_affected() as i64)
    }

    // ========== Message Operations ==========

    /// Append a message and bump the parent session's counters in one
    /// transaction, keeping `message_count` consistent with the row count.
    /// Returns the new message id.
    pub async fn append_message(&self, message: NewMessage) -> Result<i64> {
        let mut tx = self.pool.begin().await.context("starting transaction")?;

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO messages (session_id, type, subtype, content, timestamp, cost, duration, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&message.session_id)
        .bind(message.message_type.to_string())
        .bind(&message.subtype)
        .bind(&message.content)
        .bind(message.timestamp)
        .bind(message.cost)
        .bind(message.duration)
        .bind(message.metadata.as_ref().map(|m| m.to_string()))
        .fetch_one(&mut *tx)
        .await
        .context("inserting message")?;

        sqlx::query(
            "UPDATE sessions SET message_count = message_count + 1, last_activity = ? WHERE id = ?",
        )
        .bind(message.timestamp)
        .bind(&message.session_id)
        .execute(&mut *tx)
        .await
        .context("bumping session message count")?;

        tx.commit().await.context("committing message append")?;

        Ok(id)
    }

    /// List a session's messages in chronological order.
    pub async fn list_messages(&self, session_id: &str, limit: i64) -> Result<Vec<MessageRecord>> {
        sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT id, session_id, type, subtype, content, timestamp, cost, duration, metadata
            FROM messages
            WHERE session_id = ?
            ORDER BY timestamp ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing messages")
    }

    /// Substring search across message content, newest first.
    pub async fn search_messages(&self, needle: &str, limit: i64) -> Result<Vec<MessageRecord>> {
        let pattern = format!("%{}%", needle.replace('%', "\\%").replace('_', "\\_"));
        sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT m.id, m.session_id, m.type, m.subtype, m.content, m.timestamp, m.cost, m.duration, m.metadata
            FROM messages m
            JOIN sessions s ON s.id = m.session_id
            WHERE m.content LIKE ? ESCAPE '\'
            ORDER BY m.timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("searching messages")
    }

    // ========== Client Operations ==========

    /// Record a newly attached client.
    pub async fn register_client(&self, id: &str, connected_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO clients (id, connected_at)
            VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET connected_at = excluded.connected_at,
                                          disconnected_at = NULL
            "#,
        )
        .bind(id)
        .bind(connected_at)
        .execute(&self.pool)
        .await
        .context("registering client")?;

        Ok(())
    }

    /// Record the session a client is currently subscribed to.
    pub async fn set_client_session(&self, id: &str, session_id: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE clients SET current_session_id = ? WHERE id = ?")
            .bind(session_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting client session")?;

        Ok(())
    }

    /// Mark a client as disconnected.
    pub async fn mark_client_disconnected(&self, id: &str, disconnected_at: i64) -> Result<()> {
        sqlx::query(
            "UPDATE clients SET disconnected_at = ?, current_session_id = NULL WHERE id = ?",
        )
        .bind(disconnected_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking client disconnected")?;

        Ok(())
    }

    /// Get a client record by id.
    pub async fn get_client(&self, id: &str) -> Result<Option<ClientRecord>> {
        sqlx::query_as::<_, ClientRecord>(
            "SELECT id, connected_at, disconnected_at, current_session_id FROM clients WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching client")
    }

    // ========== Maintenance ==========

    /// Aggregate totals and a per-type message breakdown.
    pub async fn stats(&self) -> Result<StoreStats> {
        let total_sessions = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await
            .context("counting sessions")?;

        let active_sessions =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sessions WHERE is_active = 1")
                .fetch_one(&self.pool)
                .await
                .context("counting active sessions")?;

        let total_messages = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await
            .context("counting messages")?;

        let total_cost = sqlx::query_scalar::<_, f64>(
            "SELECT COALESCE(SUM(cost), 0.0) FROM messages WHERE cost IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await
        .context("summing message cost")?;

        let by_type: Vec<(String, i64)> =
            sqlx::query_as("SELECT type, COUNT(*) FROM messages GROUP BY type")
                .fetch_all(&self.pool)
                .await
                .context("grouping messages by type")?;

        Ok(StoreStats {
            total_sessions,
            active_sessions,
            total_messages,
            total_cost,
            messages_by_type: by_type.into_iter().collect::<HashMap<_, _>>(),
        })
    }

    /// Snapshot the database to `path` via `VACUUM INTO`.
    pub async fn backup(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating backup directory: {}", parent.display()))?;
        }

        sqlx::query("VACUUM INTO ?")
            .bind(path.to_string_lossy().to_string())
            .execute(&self.pool)
            .await
            .with_context(|| format!("backing up database to {}", path.display()))?;

        Ok(())
    }
}
