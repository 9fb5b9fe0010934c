//! WebSocket server handler using Axum.

use crate::client::{ConnectionInfo, CLIENT_CHANNEL_BUFFER_SIZE};
use crate::protocol::ServerMessage;
use crate::service::{GatewayService, GatewayStats};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

/// Shared application state.
pub struct AppState {
    pub service: Arc<GatewayService>,
}

/// Query string accepted on `/ws`.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(flatten)]
    stats: GatewayStats,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/connections", get(connections_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        stats: state.service.stats(),
    })
}

async fn connections_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ConnectionInfo>> {
    Json(state.service.connection_info())
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.user_id))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // A full buffer drops frames for this client only.
    let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_CHANNEL_BUFFER_SIZE);

    let connection = state.service.connect(user_id, tx);
    let connection_id = connection.id;

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            biased;

            _ = connection.close_requested() => {
                debug!("Closing {} on server request", connection_id);
                break;
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.service.handle_text(&connection, text.as_str());
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => state.service.handle_text(&connection, text),
                        Err(_) => {
                            connection.send(&ServerMessage::error(
                                "Invalid message format: binary frame is not UTF-8",
                            ));
                        }
                    },
                    // The socket answers pings itself; both directions prove liveness.
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        state.service.handle_pong(&connection);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", connection_id, e);
                        break;
                    }
                }
            }
        }
    }

    state.service.disconnect(&connection_id);
    drop(connection);

    // Let a queued close frame flush.
    if tokio::time::timeout(Duration::from_secs(1), &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
}
