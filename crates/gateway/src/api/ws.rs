//! WebSocket attachment to a route.
//!
//! Flow:
//! 1. Client connects to `/v1/routes/:route/ws`
//! 2. The socket becomes the route's output: every turn event is sent as a
//!    JSON text frame
//! 3. Client frames are `{"type":"message","text":...,"images":[...]}` or
//!    `{"type":"stop"}`
//! 4. On close the route output is cleared; running turns keep going

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::routes::SubmitRequest;
use crate::runtime::{SourceMessage, TurnEvent};
use crate::state::AppState;

/// Bound on events buffered for a slow socket before they are dropped.
const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Message(SubmitRequest),
    Stop,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn route_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(route): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, route))
}

async fn handle_socket(socket: WebSocket, state: AppState, route: String) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let controller = state.controller.clone();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<TurnEvent>(OUTBOUND_CAPACITY);
    let route_for_output = route.clone();
    controller.set_output(
        &route,
        Arc::new(move |event: TurnEvent| {
            if outbound_tx.try_send(event).is_err() {
                tracing::debug!(route = %route_for_output, "websocket outbound full, event dropped");
            }
        }),
    );
    let source = controller.spawn_source(&format!("ws:{route}"), 32);
    tracing::info!(route = %route, "websocket attached");

    // Writer task: forwards route events to the socket.
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let Ok(json) = serde_json::to_string(&event) else {
                continue;
            };
            if ws_sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Reader loop.
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Message(req)) => {
                    let blocks = req.into_blocks();
                    if blocks.is_empty() {
                        continue;
                    }
                    let msg = SourceMessage {
                        route: route.clone(),
                        content: blocks,
                        output: None,
                    };
                    if source.send(msg).await.is_err() {
                        break;
                    }
                }
                Ok(ClientFrame::Stop) => {
                    controller.stop(&route);
                }
                Err(e) => {
                    tracing::debug!(route = %route, error = %e, "ignoring unparseable frame");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    controller.clear_output(&route);
    writer.abort();
    tracing::info!(route = %route, "websocket detached");
}
