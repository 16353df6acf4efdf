// ============================
// roomchat-backend-lib/src/ws_router.rs
// ============================
//! WebSocket router and connection handling.
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use roomchat_common::{ClientEvent, LogoutRequest, MembersSnapshot};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::identity::ConnectionId;
use crate::lifecycle::Flow;
use crate::metrics::{EVENT_DROPPED, WS_CONNECTION, WS_DISCONNECTION};
use crate::AppState;

/// Create the HTTP + WebSocket router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/members", get(members))
        .route("/logout", post(logout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handler for WebSocket connections
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    counter!(WS_CONNECTION).increment(1);
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn members(State(state): State<Arc<AppState>>) -> Json<MembersSnapshot> {
    Json(MembersSnapshot {
        room: state.room.name().to_string(),
        members: state.room.members().iter().map(ToString::to_string).collect(),
    })
}

/// End the session for a username: its connections leave the room and close.
/// A valid name nobody holds is a no-op.
async fn logout(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LogoutRequest>,
) -> Result<StatusCode, AppError> {
    let ended = state.connections.logout(&request.username).await?;
    info!(username = %request.username, connections = ended, "logged out");
    Ok(StatusCode::NO_CONTENT)
}

fn parse_event(text: &str) -> Result<ClientEvent, AppError> {
    Ok(serde_json::from_str(text)?)
}

fn drop_event(connection: ConnectionId, kind: &'static str, error: &AppError) {
    counter!(EVENT_DROPPED, "kind" => kind).increment(1);
    if error.is_dropped_event() {
        debug!(%connection, kind, error = %error, "dropping event");
    } else {
        warn!(%connection, kind, error = %error, "dropping event");
    }
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (connection, mut outbound) = state.connections.open(state.settings.outbound_queue);
    let connection_id = connection.id();
    info!(connection = %connection_id, "client connected");

    // Writer: drain the outbox to the socket until every sender is gone.
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!(connection = %connection_id, error = %e, "failed to serialize event");
                    continue;
                },
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader: one inbound event at a time, so a sender's events fan out in order.
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            () = connection.closed() => break,
        };
        let Some(Ok(message)) = frame else {
            break;
        };

        match message {
            Message::Text(text) => match parse_event(&text) {
                Ok(event) => {
                    let kind = event.kind();
                    match connection.dispatch(event).await {
                        Ok(Flow::Continue) => {},
                        Ok(Flow::Close) => break,
                        Err(e) => drop_event(connection_id, kind, &e),
                    }
                },
                Err(e) => drop_event(connection_id, "malformed", &e),
            },
            Message::Close(_) => break,
            _ => {}, // Binary and ping/pong frames carry no room events
        }
    }

    // Cleanup: an implicit leave if the client never said goodbye
    state.connections.disconnect(connection_id).await;
    drop(connection);
    counter!(WS_DISCONNECTION).increment(1);
    info!(connection = %connection_id, "client disconnected");

    // Give the writer a moment to flush what is already queued.
    if tokio::time::timeout(state.settings.send_timeout(), &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
}
