//! SQLite message and conversation store.
//!
//! Durable side of the relay. Messages are appended before any live
//! delivery is attempted; conversations carry the two seen flags and the
//! recency timestamp that inbox listings sort by.
//!
//! ```text
//!  ┌───────────────────────┐        ┌───────────────────────┐
//!  │     conversations     │        │       messages        │
//!  ├───────────────────────┤        ├───────────────────────┤
//!  │ id                    │◄───────│ conversation_id (opt) │
//!  │ user_id, shop_id (uq) │        │ id                    │
//!  │ is_seen               │        │ user_id, shop_id      │
//!  │ is_admin_seen         │        │ content               │
//!  │ last_updated_at       │        │ is_user               │
//!  │ created_at            │        │ created_at            │
//!  └───────────────────────┘        └───────────────────────┘
//! ```
//!
//! All timestamps are Unix milliseconds.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{ParticipantKey, Role};

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    shop_id INTEGER NOT NULL,
    -- The user has seen the latest shop-authored message
    is_seen INTEGER NOT NULL DEFAULT 0,
    -- The shop/admin side has seen the latest user-authored message
    is_admin_seen INTEGER NOT NULL DEFAULT 0,
    last_updated_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (user_id, shop_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    shop_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    is_user INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    conversation_id INTEGER REFERENCES conversations(id)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(user_id, shop_id);
CREATE INDEX IF NOT EXISTS idx_conversations_recent ON conversations(last_updated_at);
"#;

const MESSAGE_COLUMNS: &str = "id, user_id, shop_id, content, is_user, created_at, conversation_id";

const CONVERSATION_COLUMNS: &str =
    "id, user_id, shop_id, is_seen, is_admin_seen, last_updated_at, created_at";

// ── Records ──────────────────────────────────────────────────────────────────

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub user_id: i64,
    pub shop_id: i64,
    pub content: String,
    /// True when the user side authored the message.
    pub is_user: bool,
    pub created_at: i64,
    pub conversation_id: Option<i64>,
}

/// A message about to be appended.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub user_id: i64,
    pub shop_id: i64,
    pub content: String,
    pub is_user: bool,
    pub conversation_id: Option<i64>,
}

/// A user ↔ shop conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: i64,
    pub user_id: i64,
    pub shop_id: i64,
    pub is_seen: bool,
    pub is_admin_seen: bool,
    pub last_updated_at: i64,
    pub created_at: i64,
}

impl ConversationRecord {
    /// Whether `participant` is one of the two sides of this conversation.
    pub fn involves(&self, participant: ParticipantKey) -> bool {
        match participant.role {
            Role::User => self.user_id == participant.id,
            Role::Shop => self.shop_id == participant.id,
        }
    }
}

/// Which of a conversation's two seen flags to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeenFlag {
    /// `is_seen`: user side has seen shop traffic.
    Seen,
    /// `is_admin_seen`: shop/admin side has seen user traffic.
    AdminSeen,
}

impl SeenFlag {
    fn column(self) -> &'static str {
        match self {
            SeenFlag::Seen => "is_seen",
            SeenFlag::AdminSeen => "is_admin_seen",
        }
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        shop_id: row.get(2)?,
        content: row.get(3)?,
        is_user: row.get(4)?,
        created_at: row.get(5)?,
        conversation_id: row.get(6)?,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRecord> {
    Ok(ConversationRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        shop_id: row.get(2)?,
        is_seen: row.get(3)?,
        is_admin_seen: row.get(4)?,
        last_updated_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}

// ── Store ────────────────────────────────────────────────────────────────────

/// Shared handle to the SQLite database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create the database.
    ///
    /// If path is None, creates an in-memory database (useful for testing).
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)
                .map_err(|e| Error::Database(format!("Failed to open database: {}", e)))?,
            None => Connection::open_in_memory().map_err(|e| {
                Error::Database(format!("Failed to create in-memory database: {}", e))
            })?,
        };

        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| Error::Database(format!("Failed to create tables: {}", e)))?;

        tracing::info!(path = path.unwrap_or(":memory:"), "Store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    /// Append a message and return the stored record.
    pub fn append_message(&self, message: &NewMessage, created_at: i64) -> Result<MessageRecord> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (user_id, shop_id, content, is_user, created_at, conversation_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.user_id,
                message.shop_id,
                message.content,
                message.is_user,
                created_at,
                message.conversation_id,
            ],
        )?;

        Ok(MessageRecord {
            id: conn.last_insert_rowid(),
            user_id: message.user_id,
            shop_id: message.shop_id,
            content: message.content.clone(),
            is_user: message.is_user,
            created_at,
            conversation_id: message.conversation_id,
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRecord>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
        Ok(conn
            .query_row(&sql, params![id], message_from_row)
            .optional()?)
    }

    /// Replace a message's content. Everything else about a message is immutable.
    pub fn update_message_content(&self, id: i64, content: &str) -> Result<MessageRecord> {
        {
            let conn = self.conn.lock();
            let updated = conn.execute(
                "UPDATE messages SET content = ?1 WHERE id = ?2",
                params![content, id],
            )?;
            if updated == 0 {
                return Err(Error::MessageNotFound(id));
            }
        }
        self.get_message(id)?.ok_or(Error::MessageNotFound(id))
    }

    pub fn delete_message(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(Error::MessageNotFound(id));
        }
        Ok(())
    }

    /// All messages of a conversation, oldest first.
    pub fn messages_for_conversation(&self, conversation_id: i64) -> Result<Vec<MessageRecord>> {
        self.query_messages(
            &format!(
                "SELECT {} FROM messages WHERE conversation_id = ?1
                 ORDER BY created_at ASC, id ASC",
                MESSAGE_COLUMNS
            ),
            params![conversation_id],
        )
    }

    /// Messages of a conversation strictly newer than `since`, oldest first.
    pub fn messages_since(&self, conversation_id: i64, since: i64) -> Result<Vec<MessageRecord>> {
        self.query_messages(
            &format!(
                "SELECT {} FROM messages WHERE conversation_id = ?1 AND created_at > ?2
                 ORDER BY created_at ASC, id ASC",
                MESSAGE_COLUMNS
            ),
            params![conversation_id, since],
        )
    }

    /// All messages between a user and a shop, newest first.
    pub fn messages_between(&self, user_id: i64, shop_id: i64) -> Result<Vec<MessageRecord>> {
        self.query_messages(
            &format!(
                "SELECT {} FROM messages WHERE user_id = ?1 AND shop_id = ?2
                 ORDER BY created_at DESC, id DESC",
                MESSAGE_COLUMNS
            ),
            params![user_id, shop_id],
        )
    }

    pub fn last_message(&self, conversation_id: i64) -> Result<Option<MessageRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM messages WHERE conversation_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT 1",
            MESSAGE_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![conversation_id], message_from_row)
            .optional()?)
    }

    fn query_messages(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<MessageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, message_from_row)?;
        let messages = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    // ── Conversations ────────────────────────────────────────────────────────

    /// Create a conversation between a user and a shop.
    /// At most one conversation exists per pair.
    pub fn create_conversation(
        &self,
        user_id: i64,
        shop_id: i64,
        created_at: i64,
    ) -> Result<ConversationRecord> {
        let conn = self.conn.lock();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM conversations WHERE user_id = ?1 AND shop_id = ?2",
                params![user_id, shop_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(Error::ConversationExists { user_id, shop_id });
        }

        conn.execute(
            "INSERT INTO conversations
                (user_id, shop_id, is_seen, is_admin_seen, last_updated_at, created_at)
             VALUES (?1, ?2, 0, 0, ?3, ?3)",
            params![user_id, shop_id, created_at],
        )?;

        Ok(ConversationRecord {
            id: conn.last_insert_rowid(),
            user_id,
            shop_id,
            is_seen: false,
            is_admin_seen: false,
            last_updated_at: created_at,
            created_at,
        })
    }

    pub fn get_conversation(&self, id: i64) -> Result<Option<ConversationRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM conversations WHERE id = ?1",
            CONVERSATION_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![id], conversation_from_row)
            .optional()?)
    }

    /// Fetch a conversation or fail with not-found.
    pub fn require_conversation(&self, id: i64) -> Result<ConversationRecord> {
        self.get_conversation(id)?
            .ok_or(Error::ConversationNotFound(id))
    }

    pub fn conversations_for_user(&self, user_id: i64) -> Result<Vec<ConversationRecord>> {
        self.query_conversations("WHERE user_id = ?1", params![user_id])
    }

    pub fn conversations_for_shop(&self, shop_id: i64) -> Result<Vec<ConversationRecord>> {
        self.query_conversations("WHERE shop_id = ?1", params![shop_id])
    }

    pub fn all_conversations(&self) -> Result<Vec<ConversationRecord>> {
        self.query_conversations("", params![])
    }

    /// Conversations with user traffic the admin side has not seen yet.
    pub fn unseen_for_admin(&self) -> Result<Vec<ConversationRecord>> {
        self.query_conversations("WHERE is_admin_seen = 0", params![])
    }

    /// Most recently updated first.
    fn query_conversations(
        &self,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ConversationRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM conversations {} ORDER BY last_updated_at DESC, id DESC",
            CONVERSATION_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, conversation_from_row)?;
        let conversations = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conversations)
    }

    /// Write one seen flag. When `touched_at` is set, `last_updated_at`
    /// moves to it unless it already holds a later value.
    pub fn update_seen_flag(
        &self,
        conversation_id: i64,
        flag: SeenFlag,
        value: bool,
        touched_at: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let updated = match touched_at {
            Some(now) => conn.execute(
                &format!(
                    "UPDATE conversations SET {} = ?1, last_updated_at = MAX(last_updated_at, ?2)
                     WHERE id = ?3",
                    flag.column()
                ),
                params![value, now, conversation_id],
            )?,
            None => conn.execute(
                &format!("UPDATE conversations SET {} = ?1 WHERE id = ?2", flag.column()),
                params![value, conversation_id],
            )?,
        };

        if updated == 0 {
            return Err(Error::ConversationNotFound(conversation_id));
        }
        Ok(())
    }

    /// Delete a conversation together with its messages.
    pub fn delete_conversation(&self, id: i64) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let messages = tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![id],
        )?;
        let deleted = tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        if deleted == 0 {
            // Dropping the transaction rolls it back
            return Err(Error::ConversationNotFound(id));
        }

        tx.commit()?;
        tracing::info!(conversation_id = id, messages = messages, "Conversation deleted");
        Ok(messages)
    }

    /// Number of stored messages (for stats).
    pub fn message_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?)
    }
}
