//! WebSocket Handler
//!
//! Per-connection pump: register, relay inbound text frames until the peer
//! leaves, unregister. Each connection runs a reader and a writer joined by
//! `select!`; whichever finishes first closes the connection.

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures::stream::SplitStream;
use futures::{Sink, sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::dispatch::dispatch;
use super::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, Registration};
use crate::config::WebSocketConfig;
use crate::error::RelayError;
use crate::metrics::RelayMetrics;

/// Lifecycle of one relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionPhase {
    pub fn can_transition_to(self, next: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        match (self, next) {
            (Connecting, Open) | (Open, Open) | (Open, Closing) => true,
            (Closed, _) => false,
            (_, Closed) => true,
            _ => false,
        }
    }

    fn advance(&mut self, id: ConnectionId, next: ConnectionPhase) {
        debug_assert!(
            self.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self,
            next
        );
        debug!(conn = %id, "{:?} -> {:?}", self, next);
        *self = next;
    }
}

/// Why a connection left the `Open` phase.
#[derive(Debug)]
pub enum CloseReason {
    /// Peer sent a close frame
    PeerClosed,
    /// Stream ended without a close frame
    PeerGone,
    ReadError(axum::Error),
    IdleTimeout(Duration),
    WriteFailed(RelayError),
    /// Server-side cancellation (shutdown or eviction)
    Cancelled,
}

/// Registry membership plus the connection gauge. Dropping it is the
/// `-> Closed` transition, so it also runs if the task is aborted.
struct LiveConnection {
    registration: Registration,
    metrics: Option<Arc<RelayMetrics>>,
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        if let Some(ref m) = self.metrics {
            m.connection_closed();
        }
        debug!(conn = %self.registration.id(), "Connection closed");
    }
}

/// Handle an upgraded relay WebSocket until it closes.
pub async fn handle_relay_ws(
    socket: WebSocket,
    registry: Arc<ConnectionRegistry>,
    config: WebSocketConfig,
    metrics: Option<Arc<RelayMetrics>>,
    shutdown: CancellationToken,
) {
    let id = ConnectionId::next();
    run_connection(id, socket, registry, config, metrics, shutdown)
        .instrument(info_span!("relay", conn = %id))
        .await
}

async fn run_connection(
    id: ConnectionId,
    socket: WebSocket,
    registry: Arc<ConnectionRegistry>,
    config: WebSocketConfig,
    metrics: Option<Arc<RelayMetrics>>,
    shutdown: CancellationToken,
) {
    let mut phase = ConnectionPhase::Connecting;

    let cancel = shutdown.child_token();
    let (tx, rx) = mpsc::channel::<Utf8Bytes>(config.send_queue_capacity);
    let handle = ConnectionHandle::new(id, tx, cancel.clone());

    let Some(registration) = registry.enroll(handle) else {
        warn!("Connection id already registered, dropping socket");
        return;
    };
    if let Some(ref m) = metrics {
        m.connection_opened();
    }
    let live = LiveConnection {
        registration,
        metrics: metrics.clone(),
    };
    phase.advance(id, ConnectionPhase::Open);
    info!(connections = registry.len(), "Client connected");

    let (mut ws_sender, ws_receiver) = socket.split();

    let reason = tokio::select! {
        reason = pump_inbound(
            id,
            ws_receiver,
            &registry,
            config.idle_timeout,
            metrics.as_deref(),
        ) => reason,
        result = pump_outbound(
            &mut ws_sender,
            rx,
            &cancel,
            config.write_timeout,
            config.heartbeat_interval,
        ) => {
            match result {
                Ok(()) => CloseReason::Cancelled,
                Err(e) => CloseReason::WriteFailed(e),
            }
        }
    };

    phase.advance(id, ConnectionPhase::Closing);
    cancel.cancel();
    match &reason {
        CloseReason::PeerClosed | CloseReason::PeerGone | CloseReason::Cancelled => {
            debug!("Closing: {:?}", reason)
        }
        CloseReason::IdleTimeout(limit) => info!("Closing idle connection after {:?}", limit),
        CloseReason::ReadError(e) => {
            warn!("WebSocket read error: {}", e);
            if let Some(ref m) = metrics {
                m.transport_error();
            }
        }
        CloseReason::WriteFailed(e) => {
            warn!("WebSocket write failed: {}", e);
            if let Some(ref m) = metrics {
                m.transport_error();
            }
        }
    }

    // Best effort: the peer may already be gone
    let _ = tokio::time::timeout(config.write_timeout, ws_sender.close()).await;

    drop(live);
    phase.advance(id, ConnectionPhase::Closed);
    info!(connections = registry.len(), "Client disconnected");
}

/// Read frames until the connection should close, relaying text frames.
async fn pump_inbound(
    id: ConnectionId,
    mut ws_receiver: SplitStream<WebSocket>,
    registry: &ConnectionRegistry,
    idle_timeout: Option<Duration>,
    metrics: Option<&RelayMetrics>,
) -> CloseReason {
    loop {
        let next = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, ws_receiver.next()).await {
                Ok(next) => next,
                Err(_) => return CloseReason::IdleTimeout(limit),
            },
            None => ws_receiver.next().await,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                if let Some(m) = metrics {
                    m.message_received();
                }
                let report = dispatch(registry, id, &text, metrics);
                debug!(
                    bytes = text.as_str().len(),
                    delivered = report.delivered,
                    skipped = report.skipped_closed,
                    failed = report.failed,
                    "Relayed frame"
                );
            }
            Some(Ok(Message::Binary(data))) => {
                debug!(bytes = data.len(), "Ignoring binary frame");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => return CloseReason::PeerClosed,
            Some(Err(e)) => return CloseReason::ReadError(e),
            None => return CloseReason::PeerGone,
        }
    }
}

/// Drain the outbound queue into the socket. Returns `Ok` when cancelled,
/// `Err` when a write fails or stalls.
async fn pump_outbound<S>(
    ws_sender: &mut S,
    mut rx: mpsc::Receiver<Utf8Bytes>,
    cancel: &CancellationToken,
    write_timeout: Duration,
    heartbeat_interval: Option<Duration>,
) -> Result<(), RelayError>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let mut heartbeat = heartbeat_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let close = Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: "relay shutting down".into(),
                }));
                let _ = send_with_timeout(ws_sender, close, write_timeout).await;
                return Ok(());
            }
            next = rx.recv() => match next {
                Some(text) => Message::Text(text),
                // Every sender dropped: nothing more can arrive
                None => return Ok(()),
            },
            _ = tick(&mut heartbeat) => Message::Ping(Bytes::new()),
        };
        send_with_timeout(ws_sender, frame, write_timeout).await?;
    }
}

async fn send_with_timeout<S>(
    ws_sender: &mut S,
    msg: Message,
    limit: Duration,
) -> Result<(), RelayError>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    match tokio::time::timeout(limit, ws_sender.send(msg)).await {
        Ok(result) => result.map_err(RelayError::from),
        Err(_) => Err(RelayError::WriteTimeout(limit)),
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
