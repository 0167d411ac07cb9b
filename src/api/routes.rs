//! API route definitions.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::ws::ws_handler;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let api = Router::new()
        // Hub surface
        .route("/sessions", get(handlers::list_sessions))
        .route("/query", post(handlers::query))
        .route("/config", get(handlers::get_config))
        .route("/health", get(handlers::health))
        // Store surface
        .route("/db/sessions", get(handlers::db_list_sessions))
        .route("/db/sessions/active", get(handlers::db_list_active_sessions))
        .route(
            "/db/sessions/{session_id}",
            get(handlers::db_get_session).delete(handlers::db_delete_session),
        )
        .route(
            "/db/sessions/{session_id}/messages",
            get(handlers::db_list_messages),
        )
        .route("/db/stats", get(handlers::db_stats))
        .route("/db/search", get(handlers::db_search))
        .route("/db/cleanup", post(handlers::db_cleanup))
        .route("/db/backup", post(handlers::db_backup))
        // WebSocket endpoint
        .route("/ws", get(ws_handler));

    Router::new()
        .nest("/api/ccsdk", api)
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}
