use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod config;
mod error;
mod handlers;
mod metrics;
#[cfg(test)]
mod test_helpers;
mod ws;

use crate::config::{CliOverrides, RelayConfig};
use crate::metrics::RelayMetrics;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "WebSocket relay that broadcasts each message to every other client")]
struct Cli {
    /// Path to a relay.toml config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides PORT and the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    /// Live relay connections
    pub registry: Arc<ws::ConnectionRegistry>,
    pub relay_config: Arc<RelayConfig>,
    pub metrics: Arc<RelayMetrics>,
    /// Parent of every connection's cancellation token
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(relay_config: RelayConfig) -> Self {
        Self {
            registry: Arc::new(ws::ConnectionRegistry::new()),
            relay_config: Arc::new(relay_config),
            metrics: Arc::new(RelayMetrics::new()),
            shutdown: CancellationToken::new(),
        }
    }
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handlers::relay_websocket_handler))
        // Health endpoints
        .route("/healthz", get(handlers::healthz_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "relay=debug,tower_http=debug,info"
    } else {
        "relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let file_config = config::resolve(
        cli.config.as_deref(),
        CliOverrides {
            host: cli.host,
            port: cli.port,
        },
    )?;
    let relay_config = RelayConfig::from_file(&file_config)?;
    info!(
        "Relay config: queue={} max_message={}KB write_timeout={:?} idle_timeout={:?} heartbeat={:?}",
        relay_config.websocket.send_queue_capacity,
        relay_config.websocket.max_message_bytes / 1024,
        relay_config.websocket.write_timeout,
        relay_config.websocket.idle_timeout,
        relay_config.websocket.heartbeat_interval,
    );

    let addr = relay_config.bind_addr;
    let state = AppState::new(relay_config);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Relay listening on http://{}", actual_addr);
    info!("  GET /ws           - relay WebSocket");
    info!("  GET /healthz      - liveness probe");
    info!("  GET /health       - connection count and uptime");
    info!("  GET /metrics      - relay counters");

    serve_until(listener, state, wait_for_signal()).await?;

    info!("Shutdown complete");
    Ok(())
}

/// Serve until `signal` resolves, then close every relay connection and wait
/// for them to unregister.
///
/// Upgraded sockets run in their own tasks, which graceful shutdown does not
/// track, so `serve` returning says nothing about them.
pub(crate) async fn serve_until<F>(
    listener: tokio::net::TcpListener,
    state: AppState,
    signal: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state.clone());
    let shutdown = state.shutdown.clone();
    let shutdown_signal = async move {
        signal.await;
        info!("Received shutdown signal, closing connections...");
        shutdown.cancel();
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    // Close frame plus sink close, each bounded by the write timeout
    let limit = state.relay_config.websocket.write_timeout.saturating_mul(2);
    if !state.registry.shutdown(limit).await {
        warn!(
            remaining = state.registry.len(),
            "Connections still open after {:?}", limit
        );
    }

    server_result
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
