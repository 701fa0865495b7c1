//! WebSocket event streaming

use crate::api::handlers::AppState;
use axum::{
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    response::Response,
};
use tracing::{debug, error, info};

/// WebSocket upgrade handler.
pub async fn events_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("new WebSocket client connected");

    let snapshot = state.snapshot_rx.borrow().clone();
    if let Ok(json) = serde_json::to_string(&snapshot) {
        if socket.send(axum::extract::ws::Message::Text(json)).await.is_err() {
            return;
        }
    }

    let mut rx = state.bus.subscribe();
    let mut dropped_count: usize = 0;

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        if dropped_count > 0 {
                            let dropped_event = serde_json::json!({
                                "type": "backpressure",
                                "droppedCount": dropped_count,
                            });
                            if let Ok(json) = serde_json::to_string(&dropped_event) {
                                let _ = socket.send(axum::extract::ws::Message::Text(json)).await;
                            }
                            dropped_count = 0;
                        }

                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if let Err(e) = socket.send(axum::extract::ws::Message::Text(json)).await {
                                    error!("failed to send event to client: {}", e);
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("failed to serialize event: {}", e);
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        dropped_count += n as usize;
                        debug!("client lagging, dropped {} events (total: {})", n, dropped_count);
                    }
                    Err(e) => {
                        error!("event channel error: {}", e);
                        break;
                    }
                }
            }

            msg = socket.recv() => {
                match msg {
                    Some(Ok(axum::extract::ws::Message::Close(_))) => {
                        debug!("client closed connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        debug!("WebSocket closed");
                        break;
                    }
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}
