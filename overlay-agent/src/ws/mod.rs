//! WebSocket event stream.
//!
//! Pushes every `EngineEvent` to connected clients as
//! `{"type": ..., "payload": ...}` JSON. Clients only listen; anything they
//! send besides close frames is ignored.

use crate::api::AppState;
use crate::engine::{Engine, EngineEvent};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.engine))
}

fn encode(event: &EngineEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            error!("Failed to serialize event: {:?}", e);
            None
        }
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, engine: Arc<Engine>) {
    info!("New WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut rx = engine.subscribe();

    // Start every client off with the current state.
    let current = EngineEvent::StateChanged {
        state: engine.state(),
    };
    if let Some(msg) = encode(&current) {
        if sender.send(msg).await.is_err() {
            return;
        }
    }

    // Forward broadcast events to this client
    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Some(msg) = encode(&event) else {
                        continue;
                    };
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("WebSocket client lagged, {} event(s) dropped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Drain incoming frames until the client goes away
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Close(_) => break,
                other => debug!("Ignoring WebSocket message: {:?}", other),
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("WebSocket client disconnected");
}
