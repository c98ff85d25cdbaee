//! Conversation seen-state.
//!
//! Each conversation keeps one flag per direction:
//!
//! - `is_admin_seen`: the shop/admin side has seen the latest user message.
//! - `is_seen`: the user side has seen the latest shop message.
//!
//! A new message resets the flag for its direction to whether it was
//! delivered live; opening the conversation sets it back to true.

use chrono::Utc;

use crate::dispatch::DeliveryOutcome;
use crate::error::{Error, Result};
use crate::protocol::{ParticipantKey, Role};
use crate::store::{SeenFlag, Store};

/// Flag driven by messages authored by `sender`.
fn flag_for_sender(sender: Role) -> SeenFlag {
    match sender {
        Role::User => SeenFlag::AdminSeen,
        Role::Shop => SeenFlag::Seen,
    }
}

/// Flag a `reader` clears by opening the conversation.
fn flag_for_reader(reader: Role) -> SeenFlag {
    flag_for_sender(reader.counterpart())
}

#[derive(Clone)]
pub struct SeenStateUpdater {
    store: Store,
}

impl SeenStateUpdater {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Update a conversation after a message from `sender` was persisted.
    pub fn record_message(
        &self,
        conversation_id: i64,
        sender: Role,
        outcome: DeliveryOutcome,
    ) -> Result<()> {
        self.record_message_at(
            conversation_id,
            sender,
            outcome,
            Utc::now().timestamp_millis(),
        )
    }

    pub fn record_message_at(
        &self,
        conversation_id: i64,
        sender: Role,
        outcome: DeliveryOutcome,
        now: i64,
    ) -> Result<()> {
        let flag = flag_for_sender(sender);
        self.store
            .update_seen_flag(conversation_id, flag, outcome.is_delivered(), Some(now))?;

        tracing::debug!(
            conversation_id = conversation_id,
            sender = %sender,
            outcome = ?outcome,
            "Recorded message seen-state"
        );
        Ok(())
    }

    /// `reader` opened the conversation. Recency is left alone.
    pub fn mark_seen(&self, conversation_id: i64, reader: Role) -> Result<()> {
        self.store
            .update_seen_flag(conversation_id, flag_for_reader(reader), true, None)
    }

    /// `mark_seen` on behalf of a known participant, who must be one of the
    /// conversation's two sides.
    pub fn mark_seen_by(&self, conversation_id: i64, reader: ParticipantKey) -> Result<()> {
        let conversation = self.store.require_conversation(conversation_id)?;
        if !conversation.involves(reader) {
            return Err(Error::NotAParticipant {
                conversation_id,
                participant: reader.to_string(),
            });
        }
        self.mark_seen(conversation_id, reader.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::store::ConversationRecord;

    fn setup() -> (SeenStateUpdater, Store, ConversationRecord) {
        let store = Store::open(None).unwrap();
        let conv = store.create_conversation(1, 5, 1000).unwrap();
        (SeenStateUpdater::new(store.clone()), store, conv)
    }

    #[test]
    fn test_user_message_delivered_sets_admin_seen() {
        let (seen, store, conv) = setup();
        seen.record_message_at(conv.id, Role::User, DeliveryOutcome::Delivered, 2000)
            .unwrap();

        let c = store.require_conversation(conv.id).unwrap();
        assert!(c.is_admin_seen);
        assert!(!c.is_seen);
        assert_eq!(c.last_updated_at, 2000);
    }

    #[test]
    fn test_shop_message_offline_clears_seen() {
        let (seen, store, conv) = setup();
        seen.mark_seen(conv.id, Role::User).unwrap();
        assert!(store.require_conversation(conv.id).unwrap().is_seen);

        seen.record_message_at(conv.id, Role::Shop, DeliveryOutcome::Offline, 2000)
            .unwrap();
        let c = store.require_conversation(conv.id).unwrap();
        assert!(!c.is_seen);
        assert_eq!(c.last_updated_at, 2000);
    }

    #[test]
    fn test_offline_still_advances_recency() {
        let (seen, store, conv) = setup();
        seen.record_message_at(conv.id, Role::User, DeliveryOutcome::Offline, 1500)
            .unwrap();
        assert_eq!(
            store.require_conversation(conv.id).unwrap().last_updated_at,
            1500
        );
    }

    #[test]
    fn test_record_message_uses_wall_clock() {
        let (seen, store, conv) = setup();
        let before = Utc::now().timestamp_millis();
        seen.record_message(conv.id, Role::User, DeliveryOutcome::Offline)
            .unwrap();
        assert!(store.require_conversation(conv.id).unwrap().last_updated_at >= before);
    }

    #[test]
    fn test_mark_seen_by_reader_role() {
        let (seen, store, conv) = setup();

        seen.mark_seen(conv.id, Role::Shop).unwrap();
        let c = store.require_conversation(conv.id).unwrap();
        assert!(c.is_admin_seen);
        assert!(!c.is_seen);

        seen.mark_seen(conv.id, Role::User).unwrap();
        assert!(store.require_conversation(conv.id).unwrap().is_seen);
    }

    #[test]
    fn test_mark_seen_is_idempotent_and_keeps_recency() {
        let (seen, store, conv) = setup();

        seen.mark_seen(conv.id, Role::Shop).unwrap();
        let once = store.require_conversation(conv.id).unwrap();
        seen.mark_seen(conv.id, Role::Shop).unwrap();
        let twice = store.require_conversation(conv.id).unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.last_updated_at, conv.last_updated_at);
    }

    #[test]
    fn test_mark_seen_by_outsider_is_rejected() {
        let (seen, store, conv) = setup();

        assert!(matches!(
            seen.mark_seen_by(conv.id, ParticipantKey::shop(7)),
            Err(Error::NotAParticipant { .. })
        ));
        assert!(matches!(
            seen.mark_seen_by(conv.id, ParticipantKey::user(5)),
            Err(Error::NotAParticipant { .. })
        ));
        assert_eq!(store.require_conversation(conv.id).unwrap(), conv);

        seen.mark_seen_by(conv.id, ParticipantKey::shop(5)).unwrap();
        assert!(store.require_conversation(conv.id).unwrap().is_admin_seen);
    }

    #[test]
    fn test_unknown_conversation_is_not_found() {
        let (seen, _store, _conv) = setup();
        assert!(matches!(
            seen.record_message(999, Role::User, DeliveryOutcome::Delivered),
            Err(Error::ConversationNotFound(999))
        ));
        assert!(matches!(
            seen.mark_seen(999, Role::Shop),
            Err(Error::ConversationNotFound(999))
        ));
    }
}
