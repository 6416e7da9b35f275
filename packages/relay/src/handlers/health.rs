use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;
use crate::metrics;

/// Liveness probe for platform health checks - plain text, no state
pub async fn healthz_handler() -> &'static str {
    "OK\n"
}

/// Health check endpoint - returns relay status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();

    Json(metrics::HealthStatus {
        status: "healthy".to_string(),
        connections: state.registry.len() as u64,
        uptime_secs: snapshot.uptime_secs,
    })
}

/// Metrics endpoint - returns relay counters
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}
