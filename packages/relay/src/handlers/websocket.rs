use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use tracing::warn;

use crate::AppState;
use crate::ws;

/// Relay WebSocket handler - every text frame is broadcast to all other clients
pub async fn relay_websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let registry = state.registry.clone();
    let metrics = state.metrics.clone();
    let config = state.relay_config.websocket.clone();
    let shutdown = state.shutdown.clone();

    ws.max_message_size(config.max_message_bytes)
        .on_failed_upgrade(|e| warn!("WebSocket upgrade failed: {}", e))
        .on_upgrade(move |socket| {
            ws::handle_relay_ws(socket, registry, config, Some(metrics), shutdown)
        })
}
