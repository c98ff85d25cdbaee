//! Error types for the relay.
//!
//! Only caller-input problems and storage failures are errors. A recipient
//! being offline, or a connection vanishing mid-push, is a normal outcome
//! and never reaches this type.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::api::ApiResponse;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the relay.
#[derive(Error, Debug)]
pub enum Error {
    /// No conversation with this id exists.
    #[error("Conversation {0} not found.")]
    ConversationNotFound(i64),

    /// No message with this id exists.
    #[error("Message {0} not found.")]
    MessageNotFound(i64),

    /// A conversation between this user and shop already exists.
    #[error("A conversation already exists between user {user_id} and shop {shop_id}.")]
    ConversationExists { user_id: i64, shop_id: i64 },

    /// The conversation exists but belongs to a different user/shop pair
    /// than the one the caller named.
    #[error("Conversation {conversation_id} is not between user {user_id} and shop {shop_id}.")]
    ConversationMismatch {
        conversation_id: i64,
        user_id: i64,
        shop_id: i64,
    },

    /// The participant does not take part in the conversation.
    #[error("Conversation {conversation_id} does not involve {participant}.")]
    NotAParticipant {
        conversation_id: i64,
        participant: String,
    },

    /// Message content failed validation.
    #[error("Invalid message content: {0}")]
    InvalidContent(String),

    /// The underlying SQLite store failed.
    #[error("Database error: {0}")]
    Database(String),
}

impl Error {
    /// HTTP status this error maps to at the REST boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::ConversationNotFound(_) | Error::MessageNotFound(_) => StatusCode::NOT_FOUND,
            Error::ConversationExists { .. } => StatusCode::CONFLICT,
            Error::ConversationMismatch { .. } | Error::InvalidContent(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NotAParticipant { .. } => StatusCode::FORBIDDEN,
            Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this is a not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ConversationNotFound(_) | Error::MessageNotFound(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
        }
        (
            status,
            Json(ApiResponse::<()> {
                ok: false,
                data: None,
                error: Some(self.to_string()),
            }),
        )
            .into_response()
    }
}
