//! WebSocket handler for client connections.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::api::AppState;
use crate::hub::{GatewayError, SubscriberSender};
use crate::store::now_ms;

use super::types::{decode_command, ClientCommand, ServerEvent};

/// Size of the per-connection send buffer. A subscriber that falls this far
/// behind is dropped rather than stalling the fan-out.
const CLIENT_BUFFER_SIZE: usize = 64;

/// WebSocket upgrade handler.
///
/// GET /api/ccsdk/ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Handle one WebSocket connection until close or idle timeout.
async fn handle_connection(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4().to_string();
    info!("WebSocket client {} connected", client_id);

    let (mut sink, mut inbound) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(CLIENT_BUFFER_SIZE);

    state.hub.client_connected(&client_id);
    if let Err(e) = state.store.register_client(&client_id, now_ms()).await {
        warn!("Failed to persist client {}: {:#}", client_id, e);
    }

    let connected = ServerEvent::Connected {
        message: "Connected to ccsdk gateway".to_string(),
        available_sessions: state.hub.list().await,
    };
    if send_frame(&mut sink, &connected).await.is_err() {
        state.hub.on_client_disconnect(&client_id, None);
        return;
    }

    // Writer task: everything outbound flows through the client channel.
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if send_frame(&mut sink, &event).await.is_err() {
                break;
            }
        }
    });

    let idle_timeout = Duration::from_secs(state.config.ws_idle_timeout_s);
    let mut current_session: Option<String> = None;

    loop {
        let frame = match tokio::time::timeout(idle_timeout, inbound.next()).await {
            Err(_) => {
                info!("Client {} idle for {:?}, closing", client_id, idle_timeout);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!("WebSocket error for client {}: {}", client_id, e);
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                let result = match decode_command(&text) {
                    Ok(cmd) => {
                        handle_command(&state, &client_id, &mut current_session, &tx, cmd).await
                    }
                    Err(e) => Err(e),
                };

                if let Err(e) = result {
                    let error = match &e {
                        GatewayError::NotFound(_) => "Session not found".to_string(),
                        GatewayError::BadRequest(message) => message.clone(),
                        other => other.to_string(),
                    };
                    debug!("Command from client {} failed: {}", client_id, e);
                    let _ = tx
                        .send(ServerEvent::Error {
                            error,
                            session_id: None,
                        })
                        .await;
                }
            }
            Message::Close(_) => {
                info!("Client {} closed the connection", client_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Keepalive frames are handled by axum.
            }
            Message::Binary(_) => {
                debug!("Ignoring binary frame from client {}", client_id);
            }
        }
    }

    writer.abort();

    if let Err(e) = state
        .store
        .mark_client_disconnected(&client_id, now_ms())
        .await
    {
        warn!("Failed to persist disconnect for {}: {:#}", client_id, e);
    }
    state
        .hub
        .on_client_disconnect(&client_id, current_session.as_deref());
    info!("WebSocket client {} disconnected", client_id);
}

/// Serialize and send one frame.
async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).expect("server frames serialize");
    sink.send(Message::Text(json.into())).await
}

/// Dispatch a decoded command.
async fn handle_command(
    state: &AppState,
    client_id: &str,
    current_session: &mut Option<String>,
    tx: &SubscriberSender,
    cmd: ClientCommand,
) -> Result<(), GatewayError> {
    match cmd {
        ClientCommand::Chat {
            content,
            session_id,
            new_conversation,
        } => {
            if content.trim().is_empty() {
                return Err(GatewayError::BadRequest("chat content is empty".to_string()));
            }

            let session = state.hub.get_or_create(session_id.as_deref()).await?;

            if new_conversation {
                session.end_conversation().await;
            }

            // Auto-subscribe the sender so it sees the turn it started.
            if current_session.as_deref() != Some(session.id()) {
                switch_subscription(state, client_id, current_session, tx, session.id()).await;
            }

            session.submit(&content).await
        }

        ClientCommand::Subscribe { session_id } => {
            let Some(session) = state.hub.get(&session_id) else {
                return Err(GatewayError::NotFound(session_id));
            };

            if current_session.as_deref() != Some(session.id()) {
                switch_subscription(state, client_id, current_session, tx, session.id()).await;
            } else {
                // Repeat subscribes are idempotent.
                session.subscribe(client_id, tx.clone()).await;
            }

            let _ = tx.send(ServerEvent::Subscribed { session_id }).await;
            Ok(())
        }

        ClientCommand::Unsubscribe { session_id } => {
            if let Some(session) = state.hub.get(&session_id) {
                session.unsubscribe(client_id);
                state.hub.schedule_idle_check(&session_id);
            }

            if current_session.as_deref() == Some(session_id.as_str()) {
                *current_session = None;
                if let Err(e) = state.store.set_client_session(client_id, None).await {
                    warn!("Failed to clear client session for {}: {:#}", client_id, e);
                }
            }

            let _ = tx.send(ServerEvent::Unsubscribed { session_id }).await;
            Ok(())
        }

        // Cancel on an unknown session silently no-ops.
        ClientCommand::Cancel { session_id } => {
            if let Some(session) = state.hub.get(&session_id) {
                session.cancel().await;
            }
            Ok(())
        }

        ClientCommand::SystemInfo => {
            let _ = tx
                .send(ServerEvent::SystemInfo {
                    sessions: state.hub.list().await,
                    client_count: state.hub.client_count(),
                })
                .await;
            Ok(())
        }
    }
}

/// Move the client's single subscription to `session_id`, detaching from the
/// previous session (which becomes eligible for reclamation).
async fn switch_subscription(
    state: &AppState,
    client_id: &str,
    current_session: &mut Option<String>,
    tx: &SubscriberSender,
    session_id: &str,
) {
    if let Some(previous) = current_session.take() {
        if let Some(previous_session) = state.hub.get(&previous) {
            previous_session.unsubscribe(client_id);
            state.hub.schedule_idle_check(&previous);
        }
    }

    if let Some(session) = state.hub.get(session_id) {
        session.subscribe(client_id, tx.clone()).await;
    }
    *current_session = Some(session_id.to_string());

    if let Err(e) = state
        .store
        .set_client_session(client_id, Some(session_id))
        .await
    {
        warn!("Failed to persist client session for {}: {:#}", client_id, e);
    }
}
