//! Message send flow.
//!
//! persist → try live delivery → update conversation seen-state → acknowledge.
//!
//! Once the message row is committed the send has succeeded. Live delivery
//! and seen-state bookkeeping are best-effort from the sender's perspective.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::dispatch::{DeliveryOutcome, Dispatcher};
use crate::error::{Error, Result};
use crate::protocol::{ParticipantKey, Role, ServerMessage};
use crate::seen::SeenStateUpdater;
use crate::store::{MessageRecord, NewMessage, Store};

/// Default upper bound on message length, in characters.
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 1000;

/// A chat message as submitted by either side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub user_id: i64,
    pub shop_id: i64,
    pub content: String,
    #[serde(default)]
    pub conversation_id: Option<i64>,
}

/// What the sender gets back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendOutcome {
    pub message: MessageRecord,
    pub outcome: DeliveryOutcome,
}

#[derive(Clone)]
pub struct MessageService {
    store: Store,
    dispatcher: Dispatcher,
    seen: SeenStateUpdater,
    max_content_chars: usize,
}

impl MessageService {
    pub fn new(
        store: Store,
        dispatcher: Dispatcher,
        seen: SeenStateUpdater,
        max_content_chars: usize,
    ) -> Self {
        Self {
            store,
            dispatcher,
            seen,
            max_content_chars,
        }
    }

    /// Persist a message from `sender` and try to reach the other side.
    pub fn send_message(&self, sender: Role, request: SendMessageRequest) -> Result<SendOutcome> {
        self.validate_content(&request.content)?;
        if let Some(conversation_id) = request.conversation_id {
            let conversation = self.store.require_conversation(conversation_id)?;
            if conversation.user_id != request.user_id || conversation.shop_id != request.shop_id {
                return Err(Error::ConversationMismatch {
                    conversation_id,
                    user_id: request.user_id,
                    shop_id: request.shop_id,
                });
            }
        }

        let message = self.store.append_message(
            &NewMessage {
                user_id: request.user_id,
                shop_id: request.shop_id,
                content: request.content,
                is_user: sender == Role::User,
                conversation_id: request.conversation_id,
            },
            Utc::now().timestamp_millis(),
        )?;

        let recipient = match sender {
            Role::User => ParticipantKey::shop(message.shop_id),
            Role::Shop => ParticipantKey::user(message.user_id),
        };
        let outcome = self.dispatcher.try_deliver(
            recipient,
            ServerMessage::ReceiveMessage {
                message: message.clone(),
            },
        );

        if let Some(conversation_id) = message.conversation_id {
            // The conversation can vanish between the check above and here;
            // the message itself is already stored.
            match self.seen.record_message(conversation_id, sender, outcome) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    tracing::warn!(
                        conversation_id = conversation_id,
                        message_id = message.id,
                        "Conversation removed before seen-state update"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        conversation_id = conversation_id,
                        message_id = message.id,
                        error = %e,
                        "Failed to update conversation seen-state"
                    );
                }
            }
        }

        tracing::info!(
            message_id = message.id,
            sender = %sender,
            recipient = %recipient,
            outcome = ?outcome,
            "Message sent"
        );

        Ok(SendOutcome { message, outcome })
    }

    /// Replace the content of an existing message.
    pub fn edit_message(&self, message_id: i64, content: &str) -> Result<MessageRecord> {
        self.validate_content(content)?;
        self.store.update_message_content(message_id, content)
    }

    fn validate_content(&self, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(Error::InvalidContent(
                "Message content is required.".to_string(),
            ));
        }
        let chars = content.chars().count();
        if chars > self.max_content_chars {
            return Err(Error::InvalidContent(format!(
                "Message content cannot exceed {} characters (got {}).",
                self.max_content_chars, chars
            )));
        }
        Ok(())
    }
}
