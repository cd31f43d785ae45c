//! SQLite-based storage backend
//!
//! This module provides the SQLite implementation for persistent storage of
//! every entity the reconciliation core owns: identity, chats, messages,
//! message mutation state, contacts and activity center records.
//!
//! Entities are stored as JSON documents keyed by their stable IDs, with a few
//! extracted columns for the queries the core needs. Writes produced by one
//! reconciliation pass go through [`Storage::commit`] in a single transaction.

use crate::{
    crypto::KeyPair,
    storage::{
        activity::{ActivityCenterState, Notification},
        chat::Chat,
        contact::Contact,
        message::{Message, MessageMutations},
    },
    Error, Result,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

/// Map a clock onto SQLite's signed integers, keeping order and every value
///
/// A plain `as i64` cast turns clocks above `i64::MAX` negative, which would
/// reorder them in `ORDER BY` and in the clocked upserts.
pub(crate) fn sortable(value: u64) -> i64 {
    (value ^ (1 << 63)) as i64
}

/// Inverse of [`sortable`]
pub(crate) fn unsortable(value: i64) -> u64 {
    (value as u64) ^ (1 << 63)
}

/// Entities written by one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Chats to upsert
    pub chats: Vec<Chat>,
    /// Messages to upsert
    pub messages: Vec<Message>,
    /// Mutation state to upsert
    pub mutations: Vec<MessageMutations>,
    /// Contacts to upsert
    pub contacts: Vec<Contact>,
    /// Notifications to upsert
    pub notifications: Vec<Notification>,
    /// Activity center cursor to store
    pub activity_state: Option<ActivityCenterState>,
}

impl ChangeSet {
    /// Whether there is nothing to write
    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
            && self.messages.is_empty()
            && self.mutations.is_empty()
            && self.contacts.is_empty()
            && self.notifications.is_empty()
            && self.activity_state.is_none()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode<T: DeserializeOwned>(data: &str) -> Result<T> {
    serde_json::from_str(data).map_err(|e| Error::Storage(format!("Corrupt record: {}", e)))
}

/// SQLite-based storage manager
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Create a new storage instance with a database file
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        let mut storage = Self { conn };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory storage instance (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;

        let mut storage = Self { conn };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Initialize database schema
    fn init_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS user_identity (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                public_key TEXT NOT NULL,
                private_key BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                clock INTEGER NOT NULL,
                visible INTEGER NOT NULL,
                mentioned INTEGER NOT NULL,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS message_mutations (
                message_id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS activity_center_notifications (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS activity_center_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                has_seen INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_chat_clock ON messages(chat_id, clock);
            CREATE INDEX IF NOT EXISTS idx_messages_mentioned ON messages(mentioned);",
        )?;
        Ok(())
    }

    // ========== User Identity ==========

    /// Save the local identity keypair
    pub fn save_user_identity(&self, keypair: &KeyPair) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO user_identity (id, public_key, private_key) VALUES (1, ?1, ?2)",
            params![keypair.public_key_hex(), &keypair.private_key],
        )?;
        Ok(())
    }

    /// Load the local identity keypair
    pub fn load_user_identity(&self) -> Result<Option<KeyPair>> {
        let private_key: Option<Vec<u8>> = self
            .conn
            .query_row("SELECT private_key FROM user_identity WHERE id = 1", [], |row| row.get(0))
            .optional()?;

        private_key.map(|bytes| KeyPair::from_private_key(&bytes)).transpose()
    }

    // ========== Batched writes ==========

    /// Write every entity of a reconciliation pass atomically
    pub fn commit(&mut self, changes: &ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;

        for chat in &changes.chats {
            tx.execute(
                "INSERT OR REPLACE INTO chats (id, data) VALUES (?1, ?2)",
                params![&chat.id, encode(chat)?],
            )?;
        }

        for message in &changes.messages {
            tx.execute(
                "INSERT OR REPLACE INTO messages (id, chat_id, clock, visible, mentioned, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    &message.id,
                    &message.chat_id,
                    sortable(message.clock),
                    message.is_visible() as i32,
                    message.mentioned as i32,
                    encode(message)?,
                ],
            )?;
        }

        for mutations in &changes.mutations {
            tx.execute(
                "INSERT OR REPLACE INTO message_mutations (message_id, chat_id, data)
                 VALUES (?1, ?2, ?3)",
                params![&mutations.message_id, &mutations.chat_id, encode(mutations)?],
            )?;
        }

        for contact in &changes.contacts {
            tx.execute(
                "INSERT OR REPLACE INTO contacts (id, data) VALUES (?1, ?2)",
                params![&contact.id, encode(contact)?],
            )?;
        }

        // Clocked records: an older write never replaces a newer one, even if
        // two passes raced on the same record.
        for notification in &changes.notifications {
            tx.execute(
                "INSERT INTO activity_center_notifications (id, timestamp, updated_at, data)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    timestamp = excluded.timestamp,
                    updated_at = excluded.updated_at,
                    data = excluded.data
                 WHERE excluded.updated_at >= activity_center_notifications.updated_at",
                params![
                    &notification.id,
                    sortable(notification.timestamp),
                    sortable(notification.updated_at),
                    encode(notification)?,
                ],
            )?;
        }

        if let Some(state) = &changes.activity_state {
            tx.execute(
                "INSERT INTO activity_center_state (id, has_seen, updated_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                    has_seen = excluded.has_seen,
                    updated_at = excluded.updated_at
                 WHERE excluded.updated_at > activity_center_state.updated_at",
                params![state.has_seen as i32, sortable(state.updated_at)],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn load_one<T: DeserializeOwned>(&self, sql: &str, key: &str) -> Result<Option<T>> {
        let data: Option<String> = self
            .conn
            .query_row(sql, params![key], |row| row.get(0))
            .optional()?;
        data.as_deref().map(decode).transpose()
    }

    fn load_many<T: DeserializeOwned>(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter().map(|data| decode(data)).collect()
    }

    // ========== Chats ==========

    /// Load a chat
    pub fn load_chat(&self, id: &str) -> Result<Option<Chat>> {
        self.load_one("SELECT data FROM chats WHERE id = ?1", id)
    }

    /// Load all chats
    pub fn load_chats(&self) -> Result<Vec<Chat>> {
        self.load_many("SELECT data FROM chats ORDER BY id", [])
    }

    // ========== Messages ==========

    /// Load a message
    pub fn load_message(&self, id: &str) -> Result<Option<Message>> {
        self.load_one("SELECT data FROM messages WHERE id = ?1", id)
    }

    /// Load all messages of a chat, oldest first (including deleted ones)
    pub fn load_messages_for_chat(&self, chat_id: &str) -> Result<Vec<Message>> {
        self.load_many(
            "SELECT data FROM messages WHERE chat_id = ?1 ORDER BY clock ASC, id ASC",
            params![chat_id],
        )
    }

    /// Visible message of a chat with the highest `(clock, id)`, other than
    /// `excluding`
    pub fn load_latest_visible_message(
        &self,
        chat_id: &str,
        excluding: &str,
    ) -> Result<Option<Message>> {
        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM messages WHERE chat_id = ?1 AND id != ?2 AND visible = 1
                 ORDER BY clock DESC, id DESC LIMIT 1",
                params![chat_id, excluding],
                |row| row.get(0),
            )
            .optional()?;
        data.as_deref().map(decode).transpose()
    }

    /// Visible messages whose current text mentions the local user
    pub fn load_mentioned_messages(&self) -> Result<Vec<Message>> {
        self.load_many(
            "SELECT data FROM messages WHERE mentioned = 1 AND visible = 1
             ORDER BY clock DESC, id DESC",
            [],
        )
    }

    // ========== Message mutations ==========

    /// Load the mutation state of a message
    pub fn load_mutations(&self, message_id: &str) -> Result<Option<MessageMutations>> {
        self.load_one("SELECT data FROM message_mutations WHERE message_id = ?1", message_id)
    }

    // ========== Contacts ==========

    /// Load a contact
    pub fn load_contact(&self, id: &str) -> Result<Option<Contact>> {
        self.load_one("SELECT data FROM contacts WHERE id = ?1", id)
    }

    /// Load all contacts
    pub fn load_contacts(&self) -> Result<Vec<Contact>> {
        self.load_many("SELECT data FROM contacts ORDER BY id", [])
    }

    // ========== Activity center ==========

    /// Load a notification
    pub fn load_notification(&self, id: &str) -> Result<Option<Notification>> {
        self.load_one("SELECT data FROM activity_center_notifications WHERE id = ?1", id)
    }

    /// Load all notifications, newest first
    pub fn load_notifications(&self) -> Result<Vec<Notification>> {
        self.load_many(
            "SELECT data FROM activity_center_notifications ORDER BY timestamp DESC, id ASC",
            [],
        )
    }

    /// Load the activity center cursor
    pub fn load_activity_state(&self) -> Result<ActivityCenterState> {
        let state = self
            .conn
            .query_row(
                "SELECT has_seen, updated_at FROM activity_center_state WHERE id = 1",
                [],
                |row| {
                    Ok(ActivityCenterState {
                        has_seen: row.get::<_, i32>(0)? != 0,
                        updated_at: unsortable(row.get::<_, i64>(1)?),
                    })
                },
            )
            .optional()?;

        Ok(state.unwrap_or_default())
    }

    // ========== Utility ==========

    /// Clear all data (for testing)
    pub fn clear_all(&self) -> Result<()> {
        self.conn.execute_batch(
            "DELETE FROM messages;
             DELETE FROM message_mutations;
             DELETE FROM chats;
             DELETE FROM contacts;
             DELETE FROM activity_center_notifications;
             DELETE FROM activity_center_state;
             DELETE FROM user_identity;",
        )?;
        Ok(())
    }
}
