//! Relay metrics for observability
//!
//! Counters are updated from connection tasks and read by the health and
//! metrics endpoints.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::SendError;

/// Relay-wide metrics
#[derive(Debug, Default)]
pub struct RelayMetrics {
    // Connection metrics
    /// Currently active WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Message metrics
    /// Text frames received from clients
    pub messages_received: AtomicU64,
    /// Frames enqueued to recipients
    pub messages_delivered: AtomicU64,
    /// Frames dropped because a recipient's queue was full
    pub messages_dropped: AtomicU64,
    /// Frames aimed at a recipient whose writer had already gone away
    pub send_failures: AtomicU64,

    // Error metrics
    /// Read/write transport errors and write timeouts
    pub transport_errors: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // Message tracking
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_delivered(&self, n: u64) {
        self.messages_delivered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn send_failed(&self, err: SendError) {
        match err {
            SendError::Full => self.messages_dropped.fetch_add(1, Ordering::Relaxed),
            SendError::Closed => self.send_failures.fetch_add(1, Ordering::Relaxed),
        };
    }

    // Error tracking
    pub fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                delivered: self.messages_delivered.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
                failed: self.send_failures.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                transport: self.transport_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub transport: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: u64,
    pub uptime_secs: u64,
}
