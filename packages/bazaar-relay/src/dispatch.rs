//! Delivery dispatcher.
//!
//! Decides whether an event can reach its recipient right now. Offline is
//! an ordinary answer, not an error: the message is already persisted and
//! the client will pick it up the next time it loads the conversation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::PresenceRegistry;
use crate::protocol::{ParticipantKey, ServerMessage};

/// Result of a real-time push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    Offline,
}

impl DeliveryOutcome {
    pub fn is_delivered(self) -> bool {
        self == DeliveryOutcome::Delivered
    }
}

/// Routes events to live connections through the presence registry.
#[derive(Clone)]
pub struct Dispatcher {
    presence: PresenceRegistry,
}

impl Dispatcher {
    pub fn new(presence: PresenceRegistry) -> Self {
        Self { presence }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// Push `event` to `recipient` if they are online.
    ///
    /// The registry lookup clones the handle and releases its lock before
    /// the push. If the handle turns out to be dead, the outcome is
    /// `Offline` and the stale entry is cleaned up off the caller's path.
    pub fn try_deliver(&self, recipient: ParticipantKey, event: ServerMessage) -> DeliveryOutcome {
        let Some(handle) = self.presence.lookup(recipient) else {
            tracing::debug!(recipient = %recipient, "Recipient offline");
            return DeliveryOutcome::Offline;
        };

        if handle.push(event) {
            tracing::debug!(
                recipient = %recipient,
                connection = %handle.connection_id(),
                "Delivered live"
            );
            return DeliveryOutcome::Delivered;
        }

        tracing::warn!(
            recipient = %recipient,
            connection = %handle.connection_id(),
            "Push to stale connection failed, treating recipient as offline"
        );
        self.schedule_cleanup(recipient, handle.connection_id());
        DeliveryOutcome::Offline
    }

    /// Push a free-form notification to `recipient`.
    pub fn notify(&self, recipient: ParticipantKey, message: &str) -> DeliveryOutcome {
        self.try_deliver(
            recipient,
            ServerMessage::ReceiveNotification {
                message: message.to_string(),
            },
        )
    }

    /// Evict a dead connection. Runs as a task when a runtime is available,
    /// inline otherwise. Only the exact dead connection is removed, so a
    /// reconnect that raced in meanwhile survives.
    fn schedule_cleanup(&self, recipient: ParticipantKey, connection_id: Uuid) {
        let presence = self.presence.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    presence.disconnect_connection(recipient, connection_id);
                });
            }
            Err(_) => {
                presence.disconnect_connection(recipient, connection_id);
            }
        }
    }
}
