//! Per-operation response
//!
//! Every messenger operation returns one `Response` bundling all entities the
//! reconciliation pass touched, so a UI can apply a single update per inbound
//! batch.

use crate::storage::{ActivityCenterState, ChangeSet, Chat, Contact, Message, Notification};
use std::collections::BTreeMap;

/// Entities changed by one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    chats: BTreeMap<String, Chat>,
    messages: BTreeMap<String, Message>,
    contacts: BTreeMap<String, Contact>,
    notifications: BTreeMap<String, Notification>,
    activity_state: Option<ActivityCenterState>,
    removed_messages: Vec<String>,
}

impl Response {
    /// Empty response
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a changed chat
    pub fn add_chat(&mut self, chat: Chat) {
        self.chats.insert(chat.id.clone(), chat);
    }

    /// Add or replace a changed message
    ///
    /// Hidden messages are reported through [`Response::removed_messages`]
    /// instead.
    pub fn add_message(&mut self, message: Message) {
        if message.is_visible() {
            self.removed_messages.retain(|id| id != &message.id);
            self.messages.insert(message.id.clone(), message);
        } else {
            self.remove_message(&message.id);
        }
    }

    /// Report a message as no longer shown
    pub fn remove_message(&mut self, message_id: &str) {
        self.messages.remove(message_id);
        if !self.removed_messages.iter().any(|id| id == message_id) {
            self.removed_messages.push(message_id.to_string());
        }
    }

    /// Add or replace a changed contact
    pub fn add_contact(&mut self, contact: Contact) {
        self.contacts.insert(contact.id.clone(), contact);
    }

    /// Add or replace a changed notification
    pub fn add_notification(&mut self, notification: Notification) {
        self.notifications.insert(notification.id.clone(), notification);
    }

    /// Set the changed activity center cursor
    pub fn set_activity_state(&mut self, state: ActivityCenterState) {
        self.activity_state = Some(state);
    }

    /// Changed chats, by ID
    pub fn chats(&self) -> Vec<&Chat> {
        self.chats.values().collect()
    }

    /// Changed chat by ID
    pub fn chat(&self, id: &str) -> Option<&Chat> {
        self.chats.get(id)
    }

    /// Visible messages added or changed, by ID
    pub fn messages(&self) -> Vec<&Message> {
        self.messages.values().collect()
    }

    /// Changed message by ID
    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    /// Changed contacts, by ID
    pub fn contacts(&self) -> Vec<&Contact> {
        self.contacts.values().collect()
    }

    /// Changed notifications, by ID
    pub fn notifications(&self) -> Vec<&Notification> {
        self.notifications.values().collect()
    }

    /// Changed activity center cursor
    pub fn activity_state(&self) -> Option<ActivityCenterState> {
        self.activity_state
    }

    /// IDs of messages that are no longer shown
    pub fn removed_messages(&self) -> &[String] {
        &self.removed_messages
    }

    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
            && self.messages.is_empty()
            && self.contacts.is_empty()
            && self.notifications.is_empty()
            && self.activity_state.is_none()
            && self.removed_messages.is_empty()
    }

    /// Fold another response into this one, later entries winning
    pub fn merge(&mut self, other: Response) {
        for (_, chat) in other.chats {
            self.add_chat(chat);
        }
        for id in other.removed_messages {
            self.remove_message(&id);
        }
        for (_, message) in other.messages {
            self.add_message(message);
        }
        for (_, contact) in other.contacts {
            self.add_contact(contact);
        }
        for (_, notification) in other.notifications {
            self.add_notification(notification);
        }
        if let Some(state) = other.activity_state {
            self.activity_state = Some(state);
        }
    }

    /// Record every entity of a committed change set
    ///
    /// Hidden messages are skipped; callers report a message that just became
    /// hidden with [`Response::remove_message`].
    pub fn record(&mut self, changes: ChangeSet) {
        for chat in changes.chats {
            self.add_chat(chat);
        }
        for message in changes.messages.into_iter().filter(Message::is_visible) {
            self.add_message(message);
        }
        for contact in changes.contacts {
            self.add_contact(contact);
        }
        for notification in changes.notifications {
            self.add_notification(notification);
        }
        if let Some(state) = changes.activity_state {
            self.set_activity_state(state);
        }
    }
}
