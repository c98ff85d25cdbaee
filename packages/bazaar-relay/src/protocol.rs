//! Relay protocol message definitions.
//!
//! Clients speak a small JSON-over-WebSocket protocol. The `type` tag of a
//! [`ServerMessage`] doubles as the event name the client listens for
//! (`receive_message`, `receive_notification`, ...).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dispatch::DeliveryOutcome;
use crate::store::MessageRecord;

// ── Participants ──────────────────────────────────────────────────────────────

/// The two sides of a marketplace conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Shop,
}

impl Role {
    /// The role on the other end of a conversation.
    pub fn counterpart(self) -> Role {
        match self {
            Role::User => Role::Shop,
            Role::Shop => Role::User,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Shop => "shop",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presence key. User 5 and shop 5 are different participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantKey {
    pub role: Role,
    pub id: i64,
}

impl ParticipantKey {
    pub fn new(role: Role, id: i64) -> Self {
        Self { role, id }
    }

    pub fn user(id: i64) -> Self {
        Self::new(Role::User, id)
    }

    pub fn shop(id: i64) -> Self {
        Self::new(Role::Shop, id)
    }
}

impl fmt::Display for ParticipantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.id)
    }
}

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this WebSocket connection to a participant.
    /// Must be sent first after connecting.
    Register { role: Role, id: i64 },

    /// Send a chat message. The sender role is the registered role.
    Send {
        user_id: i64,
        shop_id: i64,
        content: String,
        #[serde(default)]
        conversation_id: Option<i64>,
    },

    /// The client has opened a conversation and read its latest message.
    MarkSeen { conversation_id: i64 },

    /// Ping to keep connection alive.
    Ping,
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledgement of successful registration.
    Registered { role: Role, id: i64 },

    /// A chat message from the other side of a conversation.
    ReceiveMessage { message: MessageRecord },

    /// A free-form notification pushed by the backend.
    ReceiveNotification { message: String },

    /// Acknowledgement of a `send`, carrying the persisted message id
    /// and whether the recipient got it live.
    Ack {
        message_id: i64,
        outcome: DeliveryOutcome,
    },

    /// A `mark_seen` was applied.
    SeenUpdated { conversation_id: i64 },

    /// Pong response to keep connection alive.
    Pong,

    /// Error response.
    Error { message: String },
}
