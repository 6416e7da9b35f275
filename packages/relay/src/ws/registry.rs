//! Connection Registry
//!
//! The one piece of shared mutable state in the relay: the set of connections
//! whose pump is running. Callers only register, unregister and take
//! snapshots; locking stays inside.

use axum::extract::ws::Utf8Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SendError;

/// Process-unique connection identity. Never reused.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Cheap-to-clone handle for sending to one connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Utf8Bytes>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        outbound: mpsc::Sender<Utf8Bytes>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            outbound,
            cancel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// False once the connection is closing or its writer has exited.
    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.outbound.is_closed()
    }

    /// Enqueue a frame without waiting.
    pub fn try_send(&self, text: Utf8Bytes) -> Result<(), SendError> {
        self.outbound.try_send(text).map_err(SendError::from)
    }

    /// Ask the connection's tasks to shut down.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Registry of all live relay connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    /// Fired when the last member unregisters
    drained: Notify,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Returns false (and changes nothing) if its id is
    /// already present.
    pub fn register(&self, handle: ConnectionHandle) -> bool {
        match self.connections.entry(handle.id) {
            Entry::Occupied(_) => {
                debug!(conn = %handle.id, "Connection already registered");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    /// Remove a connection. Removing an absent id is a no-op.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.connections.remove(&id).is_some();
        if removed && self.connections.is_empty() {
            self.drained.notify_waiters();
        }
        removed
    }

    /// Register and get a guard that unregisters when dropped.
    ///
    /// `None` if the id was already registered.
    pub fn enroll(self: &Arc<Self>, handle: ConnectionHandle) -> Option<Registration> {
        let id = handle.id;
        self.register(handle).then(|| Registration {
            registry: self.clone(),
            id,
        })
    }

    /// Point-in-time copy of the membership. No shard lock is held once this
    /// returns, so sends can proceed while others connect or leave.
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Signal every member to close. Members unregister themselves as their
    /// pumps wind down.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().close();
        }
    }

    /// Close every member and wait up to `limit` for all of them to
    /// unregister. Returns false if some were still registered at the limit.
    pub async fn shutdown(&self, limit: Duration) -> bool {
        self.close_all();
        tokio::time::timeout(limit, self.drained()).await.is_ok()
    }

    async fn drained(&self) {
        loop {
            // Created before the check so a concurrent last unregister is not missed
            let notified = self.drained.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Membership of one connection; unregisters exactly once on drop.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
        debug!(
            conn = %self.id,
            remaining = self.registry.len(),
            "Connection unregistered"
        );
    }
}
