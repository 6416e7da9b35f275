use std::time::Duration;
use thiserror::Error;

/// Why a frame could not be handed to one recipient.
///
/// Local to that recipient: the broadcast carries on with the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// Recipient's outbound queue is at capacity
    #[error("outbound queue full")]
    Full,
    /// Recipient's writer has gone away
    #[error("connection closed")]
    Closed,
}

impl<T> From<tokio::sync::mpsc::error::TrySendError<T>> for SendError {
    fn from(err: tokio::sync::mpsc::error::TrySendError<T>) -> Self {
        match err {
            tokio::sync::mpsc::error::TrySendError::Full(_) => SendError::Full,
            tokio::sync::mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        }
    }
}

/// Errors that end a connection's writer.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("write to peer timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("websocket transport error: {0}")]
    Transport(#[from] axum::Error),
}
