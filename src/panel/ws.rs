use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::AppState;
use super::models::LogEntry;
use crate::errors::SupervisorError;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

const OFFLINE_NOTICE: &str = "Process is offline. Deploy something first.";

// ── WebSocket message types ──────────────────────────────────────────

/// Server → client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    /// Full replay of the log buffer (on connect, after a clear, after lag).
    LogHistory { entries: Vec<LogEntry> },
    /// A single newly appended entry.
    LogMessage { entry: LogEntry },
}

/// Client → server frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    TerminalInput { line: String },
    ClearHistory,
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, receiver) = socket.split();
    let (history, rx) = state.logs.subscribe();
    if send_history(&mut sender, history).await.is_err() {
        return;
    }
    tracing::debug!("observer connected");
    run_socket_loop(sender, receiver, rx, state).await;
    tracing::debug!("observer disconnected");
}

async fn send_history(
    sender: &mut SplitSink<WebSocket, Message>,
    entries: Vec<LogEntry>,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(&WsMessage::LogHistory { entries })
        .map_err(axum::Error::new)?;
    sender.send(Message::Text(json.into())).await
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines log forwarding, client message handling, and periodic ping/pong
/// health checking into a single select loop. If no Pong is received within
/// [`PONG_TIMEOUT`] after a Ping is sent, the connection is considered dead
/// and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
    state: Arc<AppState>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Log forwarding ──────────────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Resync from the buffer instead of leaving a gap.
                        tracing::debug!(skipped, "observer lagged; resending history");
                        let (history, fresh) = state.logs.subscribe();
                        rx = fresh;
                        if send_history(&mut sender, history).await.is_err() {
                            break;
                        }
                    }
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Text(text))) => handle_client_text(&state, text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

/// Apply one client text frame. Malformed frames are ignored.
pub(crate) async fn handle_client_text(state: &AppState, text: &str) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!("ignoring malformed client frame: {}", e);
            return;
        }
    };

    match msg {
        ClientMessage::TerminalInput { line } => match state.supervisor.write_input(&line).await {
            Ok(()) => {}
            Err(SupervisorError::NotRunning) => {
                state.logs.warn(OFFLINE_NOTICE);
            }
            Err(e) => {
                state.logs.error(format!("Failed to send input: {}", e));
            }
        },
        ClientMessage::ClearHistory => {
            state.logs.clear();
        }
    }
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast a WsMessage to all connected WebSocket clients.
/// Returns silently even if no clients are connected.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json); // Ignore error if no receivers
        }
        Err(e) => {
            tracing::error!("Failed to serialize WsMessage: {}", e);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
