//! Presence registry.
//!
//! Maps each online participant to the one live connection that currently
//! represents it. Backed by a sharded `DashMap`, so connect, disconnect and
//! lookups on different participants never contend on a single lock, and
//! every operation on one key is atomic.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ParticipantKey, ServerMessage};

/// A connected client's sender channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Ownership token for one live transport connection.
///
/// Pushing is a non-blocking send into the connection's outbound queue; the
/// WebSocket writer task drains that queue in FIFO order.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: Uuid,
    sender: ClientSender,
}

impl ConnectionHandle {
    pub fn new(sender: ClientSender) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            sender,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Queue an event for this connection. Returns false if the connection
    /// is gone (its writer task dropped the receiving end).
    pub fn push(&self, event: ServerMessage) -> bool {
        self.sender.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// A reference to this connection's queue that does not keep it open.
    pub fn downgrade(&self) -> WeakConnectionHandle {
        WeakConnectionHandle {
            connection_id: self.connection_id,
            sender: self.sender.downgrade(),
        }
    }
}

/// Non-owning view of a connection, held by its own socket task for replies.
///
/// Only the registry entry owns the queue. Once the entry is replaced,
/// disconnected or drained at shutdown, the queue closes and pushes here fail.
#[derive(Debug, Clone)]
pub struct WeakConnectionHandle {
    connection_id: Uuid,
    sender: mpsc::WeakUnboundedSender<ServerMessage>,
}

impl WeakConnectionHandle {
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Queue an event if the connection is still registered somewhere.
    pub fn push(&self, event: ServerMessage) -> bool {
        match self.sender.upgrade() {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }
}

/// Process-scoped registry of online participants.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    entries: Arc<DashMap<ParticipantKey, ConnectionHandle>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as the live connection for `key`.
    /// A previous handle for the same key is replaced (last connect wins).
    pub fn connect(&self, key: ParticipantKey, handle: ConnectionHandle) {
        let connection_id = handle.connection_id();
        if let Some(previous) = self.entries.insert(key, handle) {
            tracing::debug!(
                participant = %key,
                replaced = %previous.connection_id(),
                "Replaced existing connection"
            );
        }
        tracing::info!(participant = %key, connection = %connection_id, "Client registered");
    }

    /// Remove whatever handle is registered for `key`. Absent keys are a no-op.
    pub fn disconnect(&self, key: ParticipantKey) {
        if self.entries.remove(&key).is_some() {
            tracing::info!(participant = %key, "Client unregistered");
        }
    }

    /// Remove the entry for `key` only if it still belongs to `connection_id`.
    ///
    /// A socket that closes after its participant reconnected elsewhere must
    /// not evict the newer connection.
    pub fn disconnect_connection(&self, key: ParticipantKey, connection_id: Uuid) -> bool {
        let removed = self
            .entries
            .remove_if(&key, |_, handle| handle.connection_id() == connection_id)
            .is_some();
        if removed {
            tracing::info!(participant = %key, connection = %connection_id, "Client unregistered");
        }
        removed
    }

    /// Check if a participant currently has a live connection.
    pub fn is_online(&self, key: ParticipantKey) -> bool {
        self.entries.contains_key(&key)
    }

    /// Clone out the handle for `key`. The shard lock is released before
    /// this returns, so callers push without holding it.
    pub fn lookup(&self, key: ParticipantKey) -> Option<ConnectionHandle> {
        self.entries.get(&key).map(|entry| entry.value().clone())
    }

    /// Get the number of currently connected participants.
    pub fn online_count(&self) -> usize {
        self.entries.len()
    }

    pub fn online_keys(&self) -> Vec<ParticipantKey> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    /// Drop entries whose connection has already gone away.
    /// Called periodically by the sweep task.
    pub fn sweep_closed(&self) -> usize {
        let mut removed = 0usize;
        self.entries.retain(|_, handle| {
            if handle.is_closed() {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            tracing::debug!(count = removed, "Swept closed connections");
        }
        removed
    }

    /// Forget every connection. Dropping the handles closes each writer
    /// task's queue.
    pub fn shutdown(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        tracing::info!(count = count, "Presence registry shut down");
        count
    }
}
