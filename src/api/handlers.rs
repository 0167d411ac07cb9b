//! REST handlers over the store and hub.

use axum::extract::{Path, Query, State};
use axum::Json;
use futures::StreamExt;
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::EngineEvent;
use crate::store::now_ms;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

const DEFAULT_SESSION_LIMIT: i64 = 50;
const DEFAULT_MESSAGE_LIMIT: i64 = 100;
const DEFAULT_SEARCH_LIMIT: i64 = 50;
const DEFAULT_CLEANUP_DAYS: i64 = 30;

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub limit: Option<i64>,
}

/// GET /sessions: in-memory session snapshots.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.hub.list().await;
    Json(json!({
        "sessions": sessions,
        "count": sessions.len(),
    }))
}

/// POST /query: one-shot prompt, non-streaming.
pub async fn query(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let prompt = body
        .get("prompt")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing required field: prompt"))?;

    let options = state.config.stream_options();
    let mut stream = state.engine.stream(prompt.to_string(), options);

    let mut assistant_text = String::new();
    let mut terminal: Option<(bool, Option<String>, Option<f64>, Option<i64>)> = None;

    while let Some(item) = stream.next().await {
        match item {
            Ok(EngineEvent::Assistant { text }) => assistant_text.push_str(&text),
            Ok(EngineEvent::TurnResult {
                outcome,
                total_cost_usd,
                duration_ms,
                result_text,
            }) => {
                terminal = Some((
                    outcome.is_success(),
                    result_text,
                    total_cost_usd,
                    duration_ms,
                ));
                break;
            }
            Ok(_) => {}
            Err(e) => return Err(ApiError::internal(format!("engine failure: {}", e))),
        }
    }

    let (success, result_text, cost, duration) = terminal
        .ok_or_else(|| ApiError::internal("engine stream ended without a result"))?;

    let result = result_text.unwrap_or(assistant_text);
    Ok(Json(json!({
        "success": success,
        "result": result,
        "cost": cost,
        "duration": duration,
    })))
}

/// GET /config: effective default engine options.
pub async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "model": state.config.model,
        "maxTurns": state.config.max_turns,
        "cwd": state.config.cwd,
        "permissionMode": state.config.permission_mode,
    }))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "activeSessions": state.hub.active_session_count().await,
        "timestamp": now_ms(),
    }))
}

/// GET /db/sessions?limit=&offset=
pub async fn db_list_sessions(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Value>> {
    let sessions = state
        .store
        .list_sessions(
            page.limit.unwrap_or(DEFAULT_SESSION_LIMIT),
            page.offset.unwrap_or(0),
        )
        .await?;

    Ok(Json(json!({
        "sessions": sessions,
        "count": sessions.len(),
    })))
}

/// GET /db/sessions/active
pub async fn db_list_active_sessions(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let sessions = state.store.list_active_sessions().await?;
    Ok(Json(json!({
        "sessions": sessions,
        "count": sessions.len(),
    })))
}

/// GET /db/sessions/{session_id}
pub async fn db_get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state
        .store
        .get_session(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session {}", session_id)))?;

    Ok(Json(json!({ "session": session })))
}

/// GET /db/sessions/{session_id}/messages?limit=
///
/// An unknown or deleted session yields an empty list, not a 404.
pub async fn db_list_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<MessageQuery>,
) -> ApiResult<Json<Value>> {
    let messages = state
        .store
        .list_messages(&session_id, query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT))
        .await?;

    Ok(Json(json!({
        "messages": messages,
        "count": messages.len(),
    })))
}

/// DELETE /db/sessions/{session_id}: delete the row; messages cascade.
pub async fn db_delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    // Stop the in-memory session first so its runner does not write rows for
    // a conversation that is being removed.
    if let Some(session) = state.hub.evict(&session_id) {
        session.cleanup().await;
    }

    let deleted = state.store.delete_session(&session_id).await?;
    if !deleted {
        return Err(ApiError::not_found(format!("session {}", session_id)));
    }

    info!("Deleted session {}", session_id);
    Ok(Json(json!({ "success": true })))
}

/// GET /db/stats
pub async fn db_stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let stats = state.store.stats().await?;
    Ok(Json(serde_json::to_value(stats).map_err(|e| {
        ApiError::internal(format!("serializing stats: {}", e))
    })?))
}

/// GET /db/search?q=&limit=
pub async fn db_search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Value>> {
    let needle = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing required parameter: q"))?;

    let results = state
        .store
        .search_messages(needle, query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT))
        .await?;

    Ok(Json(json!({
        "results": results,
        "count": results.len(),
    })))
}

/// POST /db/cleanup body `{days?}`: reclaim old inactive sessions.
pub async fn db_cleanup(
    State(state): State<AppState>,
    body: Option<Json<Value>>,
) -> ApiResult<Json<Value>> {
    let days = body
        .as_ref()
        .and_then(|b| b.get("days"))
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_CLEANUP_DAYS);

    if days < 0 {
        return Err(ApiError::bad_request("days must be non-negative"));
    }

    let deleted = state.store.cleanup_old_sessions(days, now_ms()).await?;
    info!("Cleanup removed {} session(s) older than {} days", deleted, days);

    Ok(Json(json!({
        "success": true,
        "deleted": deleted,
    })))
}

/// POST /db/backup body `{path?}`: snapshot the database.
pub async fn db_backup(
    State(state): State<AppState>,
    body: Option<Json<Value>>,
) -> ApiResult<Json<Value>> {
    let path = match body.as_ref().and_then(|b| b.get("path")).and_then(Value::as_str) {
        Some(path) => std::path::PathBuf::from(path),
        None => state
            .config
            .db_path
            .with_file_name(format!("ccsdk-backup-{}.db", now_ms())),
    };

    state.store.backup(&path).await?;
    info!("Database backed up to {}", path.display());

    Ok(Json(json!({
        "success": true,
        "path": path,
    })))
}
