//! Per-identity state store
//!
//! `Store` is created when an identity logs in and dropped at logout. It
//! fronts [`Storage`] with write-through caches of chats and contacts, and
//! owns the per-key locks that serialize merges on the same entity.

use crate::storage::{
    activity::{ActivityCenterState, Notification},
    chat::Chat,
    contact::Contact,
    message::{Message, MessageMutations},
    storage_db::{ChangeSet, Storage},
};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lock key of a chat
pub fn chat_key(chat_id: &str) -> String {
    format!("chat:{}", chat_id)
}

/// Lock key of a message's mutation state
pub fn message_key(message_id: &str) -> String {
    format!("message:{}", message_id)
}

/// Lock key of a contact
pub fn contact_key(contact_id: &str) -> String {
    format!("contact:{}", contact_id)
}

/// Lock key of the activity center
pub const ACTIVITY_CENTER_KEY: &str = "activity-center";

/// Idle lock entries kept before a cleanup sweep
const MAX_IDLE_LOCKS: usize = 1024;

/// Async locks keyed by entity
///
/// Merges on the same key run one at a time; different keys proceed
/// concurrently. Guards must not be held across transport calls.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| Error::Storage("lock table poisoned".to_string()))?;

        if locks.len() > MAX_IDLE_LOCKS {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }

        Ok(locks.entry(key.to_string()).or_default().clone())
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = self.entry(key)?;
        Ok(lock.lock_owned().await)
    }

    /// Wait for exclusive access to several keys
    ///
    /// Keys are taken in sorted order so two callers locking overlapping sets
    /// cannot deadlock.
    pub async fn lock_all(&self, keys: &[String]) -> Result<Vec<OwnedMutexGuard<()>>> {
        let mut keys: Vec<&String> = keys.iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await?);
        }
        Ok(guards)
    }
}

/// Explicit store of one identity's reconciled state
pub struct Store {
    db: Mutex<Storage>,
    chats: RwLock<HashMap<String, Chat>>,
    contacts: RwLock<HashMap<String, Contact>>,
    locks: KeyLocks,
}

fn poisoned<T>(_: T) -> Error {
    Error::Storage("store cache poisoned".to_string())
}

impl Store {
    /// Open a store over `storage`, warming the chat and contact caches
    pub fn open(storage: Storage) -> Result<Self> {
        let chats = storage
            .load_chats()?
            .into_iter()
            .map(|chat| (chat.id.clone(), chat))
            .collect();
        let contacts = storage
            .load_contacts()?
            .into_iter()
            .map(|contact| (contact.id.clone(), contact))
            .collect();

        Ok(Self {
            db: Mutex::new(storage),
            chats: RwLock::new(chats),
            contacts: RwLock::new(contacts),
            locks: KeyLocks::new(),
        })
    }

    /// Per-key locks of this store
    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    fn with_db<R>(&self, f: impl FnOnce(&mut Storage) -> Result<R>) -> Result<R> {
        let mut db = self.db.lock().map_err(poisoned)?;
        f(&mut db)
    }

    /// Persist a change set, then refresh the caches
    ///
    /// Caches are only touched once the transaction has committed, so a
    /// failed write leaves both the database and the cached view unchanged.
    pub fn commit(&self, changes: &ChangeSet) -> Result<()> {
        self.with_db(|db| db.commit(changes))?;

        if !changes.chats.is_empty() {
            let mut chats = self.chats.write().map_err(poisoned)?;
            for chat in &changes.chats {
                chats.insert(chat.id.clone(), chat.clone());
            }
        }
        if !changes.contacts.is_empty() {
            let mut contacts = self.contacts.write().map_err(poisoned)?;
            for contact in &changes.contacts {
                contacts.insert(contact.id.clone(), contact.clone());
            }
        }
        Ok(())
    }

    /// Chat by ID
    pub fn chat(&self, id: &str) -> Result<Option<Chat>> {
        Ok(self.chats.read().map_err(poisoned)?.get(id).cloned())
    }

    /// All chats, sorted by ID
    pub fn chats(&self) -> Result<Vec<Chat>> {
        let mut chats: Vec<Chat> = self.chats.read().map_err(poisoned)?.values().cloned().collect();
        chats.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(chats)
    }

    /// Contact by ID
    pub fn contact(&self, id: &str) -> Result<Option<Contact>> {
        Ok(self.contacts.read().map_err(poisoned)?.get(id).cloned())
    }

    /// All contacts, sorted by ID
    pub fn contacts(&self) -> Result<Vec<Contact>> {
        let mut contacts: Vec<Contact> =
            self.contacts.read().map_err(poisoned)?.values().cloned().collect();
        contacts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(contacts)
    }

    /// Message by ID
    pub fn message(&self, id: &str) -> Result<Option<Message>> {
        self.with_db(|db| db.load_message(id))
    }

    /// Messages of a chat, oldest first
    pub fn messages_for_chat(&self, chat_id: &str) -> Result<Vec<Message>> {
        self.with_db(|db| db.load_messages_for_chat(chat_id))
    }

    /// Newest visible message of a chat other than `excluding`
    pub fn latest_visible_message(
        &self,
        chat_id: &str,
        excluding: &str,
    ) -> Result<Option<Message>> {
        self.with_db(|db| db.load_latest_visible_message(chat_id, excluding))
    }

    /// Visible messages mentioning the local user
    pub fn mentioned_messages(&self) -> Result<Vec<Message>> {
        self.with_db(|db| db.load_mentioned_messages())
    }

    /// Mutation state of a message, empty if none was recorded
    pub fn mutations(&self, message_id: &str, chat_id: &str) -> Result<MessageMutations> {
        Ok(self
            .with_db(|db| db.load_mutations(message_id))?
            .unwrap_or_else(|| MessageMutations::new(message_id, chat_id)))
    }

    /// Notification by ID
    pub fn notification(&self, id: &str) -> Result<Option<Notification>> {
        self.with_db(|db| db.load_notification(id))
    }

    /// All notifications, newest first
    pub fn notifications(&self) -> Result<Vec<Notification>> {
        self.with_db(|db| db.load_notifications())
    }

    /// Activity center cursor
    pub fn activity_state(&self) -> Result<ActivityCenterState> {
        self.with_db(|db| db.load_activity_state())
    }
}
