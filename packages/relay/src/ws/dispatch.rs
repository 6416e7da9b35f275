//! Broadcast fan-out.
//!
//! One inbound frame is offered to every open connection except its sender.
//! Recipients are served in turn with a non-blocking enqueue, so a full or
//! dead recipient costs the others nothing.

use axum::extract::ws::Utf8Bytes;
use tracing::{debug, warn};

use super::registry::{ConnectionId, ConnectionRegistry};
use crate::error::SendError;
use crate::metrics::RelayMetrics;

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Recipients the frame was enqueued for
    pub delivered: usize,
    /// Recipients skipped because they were already closing
    pub skipped_closed: usize,
    /// Recipients whose enqueue failed
    pub failed: usize,
}

/// Offer `text` to every open connection other than `sender`.
///
/// Never fails: per-recipient errors are logged, counted, and skipped.
pub fn dispatch(
    registry: &ConnectionRegistry,
    sender: ConnectionId,
    text: &Utf8Bytes,
    metrics: Option<&RelayMetrics>,
) -> DispatchReport {
    let mut report = DispatchReport::default();

    for recipient in registry.snapshot() {
        if recipient.id() == sender {
            continue;
        }
        if !recipient.is_open() {
            report.skipped_closed += 1;
            continue;
        }

        match recipient.try_send(text.clone()) {
            Ok(()) => report.delivered += 1,
            Err(err) => {
                report.failed += 1;
                match err {
                    SendError::Full => warn!(
                        from = %sender,
                        to = %recipient.id(),
                        "Dropping frame for slow recipient: {}", err
                    ),
                    SendError::Closed => debug!(
                        from = %sender,
                        to = %recipient.id(),
                        "Recipient went away mid-broadcast"
                    ),
                }
                if let Some(m) = metrics {
                    m.send_failed(err);
                }
            }
        }
    }

    if let Some(m) = metrics {
        m.messages_delivered(report.delivered as u64);
    }
    report
}
