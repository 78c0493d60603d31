//! WebSocket endpoint for the channel transport.
//!
//! # Connection
//!
//! ```text
//! ws://localhost:8080/ws?patient_id=<uuid>
//! ```
//!
//! `patient_id` identifies the lock holder for `lock_slot` / `unlock_slot`.
//! Without it the socket can still subscribe to rooms.
//!
//! # Message Format
//!
//! **Client → Server:**
//! ```json
//! {"type": "subscribe", "rooms": ["provider:550e8400-..."]}
//! {"type": "lock_slot", "request_id": "r1", "provider_id": "550e8400-...", "date": "2025-01-06", "time": "10:00"}
//! ```
//!
//! **Server → Client:**
//! ```json
//! {"type": "lock_result", "request_id": "r1", "granted": true, "expires_at": "2025-01-06T04:40:00Z"}
//! {"type": "event", "room": "provider:550e8400-...", "event": {"event": "slot:locked", ...}}
//! ```
//!
//! # Connection Limits
//!
//! - At most `WS_MAX_CONNECTIONS` concurrent sockets; 503 beyond that
//! - WebSocket ping every `WS_PING_INTERVAL_SECS`

use crate::metrics;
use crate::server::state::AppState;
use crate::transport::{ClientMessage, OUTBOUND_QUEUE, ServerMessage, Session};
use crate::types::{ClientId, PatientId};
use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Connect query.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// Patient acting on this connection
    pub patient_id: Option<PatientId>,
}

/// Upgrade to the channel transport.
#[allow(clippy::unused_async)]
pub async fn connect(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    let current = state.active_connections();
    let limit = state.config.websocket.max_connections;
    if current >= limit {
        warn!(current_connections = current, "WebSocket connection limit exceeded");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "Too many concurrent connections. Please try again later.",
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, query.patient_id, state))
}

async fn handle_socket(socket: WebSocket, patient_id: Option<PatientId>, state: AppState) {
    let client_id = ClientId::new();
    let count = state.ws_connections.fetch_add(1, Ordering::Relaxed) + 1;
    metrics::set_ws_connections(count);
    info!(%client_id, ?patient_id, total_connections = count, "WebSocket connection established");

    let (mut sink, mut stream) = socket.split();
    let (outbound, mut queue) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);
    let ping_every = Duration::from_secs(state.config.websocket.ping_interval.max(1));

    let mut writer = tokio::spawn(async move {
        let mut ping = interval(ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            tokio::select! {
                message = queue.recv() => {
                    let Some(message) = message else { break };
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(error) => {
                            warn!(%error, "Failed to serialize server message");
                            continue;
                        },
                    };
                    if sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = sink.close().await;
        debug!("WebSocket writer task terminated");
    });

    let mut session = Session::new(client_id, patient_id, state.fanout.clone(), outbound);

    if session.send(ServerMessage::Connected { client_id }).await.is_ok() {
        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let handled = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => session.handle(message, &state.service).await,
                            Err(error) => {
                                debug!(%client_id, %error, "Malformed client message");
                                session.send(ServerMessage::error(format!("Malformed message: {error}"))).await
                            },
                        };
                        if handled.is_err() {
                            break;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(%client_id, "Client closed connection");
                        break;
                    },
                    Some(Ok(_)) => {},
                    Some(Err(error)) => {
                        debug!(%client_id, %error, "WebSocket receive error");
                        break;
                    },
                },
                _ = &mut writer => {
                    debug!(%client_id, "Writer finished, closing session");
                    break;
                },
            }
        }
    }

    session.close().await;
    writer.abort();

    let count = state.ws_connections.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
    metrics::set_ws_connections(count);
    info!(%client_id, total_connections = count, "WebSocket connection closed");
}
