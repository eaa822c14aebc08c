//! HTTP surface of the node.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/health` | Liveness |
//! | GET | `<mount>` | WebSocket upgrade speaking the cable protocol |
//! | GET | `<mount>/stats` | Connection and broadcast counters |
//! | POST | `<mount>/broadcast` | Publish `{"stream", "message"}` |
//! | POST | `<mount>/disconnect` | Disconnect every connection matching `{"identifiers", "reconnect"}` |
//!
//! Query parameters of the upgrade request become the connection's
//! identifiers, e.g. `/cable?user=42`.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cable_core::{supported_protocols, ConnectionIdentifiers, ConnectionSession, Server};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// How long a closing socket may take to flush queued frames.
const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection hub.
    pub server: Arc<Server>,
}

/// Body of `POST <mount>/broadcast`.
#[derive(Debug, Deserialize, Serialize)]
pub struct BroadcastRequest {
    /// Target stream.
    pub stream: String,
    /// Payload delivered to subscribers.
    pub message: Value,
}

/// Body of `POST <mount>/disconnect`.
#[derive(Debug, Deserialize, Serialize)]
pub struct DisconnectRequest {
    /// Identity of the connections to close.
    pub identifiers: ConnectionIdentifiers,
    /// Whether clients may reconnect.
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
}

fn default_reconnect() -> bool {
    true
}

/// Create the router with the cable endpoint mounted at `mount_path`.
pub fn create_router(state: AppState, mount_path: &str) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(mount_path, get(ws_handler))
        .route(&format!("{}/stats", mount_path), get(get_stats))
        .route(&format!("{}/broadcast", mount_path), post(broadcast))
        .route(&format!("{}/disconnect", mount_path), post(disconnect))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(identifiers): Query<ConnectionIdentifiers>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.protocols(supported_protocols().iter().copied())
        .on_upgrade(move |socket| handle_socket(socket, state.server, identifiers))
}

/// Pump frames between a WebSocket and a server connection until either
/// side closes.
async fn handle_socket(
    socket: WebSocket,
    server: Arc<Server>,
    identifiers: ConnectionIdentifiers,
) {
    let ConnectionSession {
        handle,
        mut outbound,
    } = match server.connect(identifiers) {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "Refusing WebSocket connection");
            let mut socket = socket;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };
    let connection_id = handle.id().to_string();
    info!(
        connection_id = %connection_id,
        protocol = ?socket.protocol(),
        "WebSocket client connected"
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_id = connection_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        // The connection closed its outbound queue: end the socket too.
        let _ = ws_sender.close().await;
        debug!(connection_id = %send_id, "Send task ended");
    });

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if handle.receive(text.to_string()).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(connection_id = %connection_id, "WebSocket close received");
                    break;
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!(connection_id = %connection_id, "Binary message ignored");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Err(e)) => {
                    error!(connection_id = %connection_id, error = %e, "WebSocket error");
                    break;
                }
            },
        }
    }

    let _ = handle.close();
    if !send_task.is_finished()
        && tokio::time::timeout(SEND_DRAIN_TIMEOUT, &mut send_task)
            .await
            .is_err()
    {
        send_task.abort();
    }
    info!(connection_id = %connection_id, "WebSocket client disconnected");
}

async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.server.stats())
}

async fn broadcast(
    State(state): State<AppState>,
    Json(request): Json<BroadcastRequest>,
) -> Response {
    match state.server.broadcast(&request.stream, &request.message).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            error!(stream = %request.stream, error = %e, "Broadcast failed");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

async fn disconnect(
    State(state): State<AppState>,
    Json(request): Json<DisconnectRequest>,
) -> Response {
    if request.identifiers.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            "identifiers must not be empty",
        )
            .into_response();
    }
    match state
        .server
        .disconnect_remote(&request.identifiers, request.reconnect)
        .await
    {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            error!(error = %e, "Remote disconnect failed");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}
