//! Message structures and per-message mutation state

use crate::clock::Register;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Represents a stored chat message
///
/// The mutable fields (`text`, `deleted`, `pinned`, `deleted_for_me`) are a
/// projection of the message's [`MessageMutations`] and are recomputed every
/// time a mutation or the message itself is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Content hash of signer + payload
    pub id: String,
    /// Chat the message belongs to (local chat ID)
    pub chat_id: String,
    /// Logical clock
    pub clock: u64,
    /// Sender's wall time (ms)
    pub timestamp: u64,
    /// Signer public key
    pub from: String,
    /// Current text
    pub text: String,
    /// ID of the message this one replies to
    #[serde(default)]
    pub response_to: Option<String>,
    /// Whether the local user has seen the message
    #[serde(default)]
    pub seen: bool,
    /// Whether the current text mentions the local user
    #[serde(default)]
    pub mentioned: bool,
    /// Deleted for everyone
    #[serde(default)]
    pub deleted: bool,
    /// Who deleted it
    #[serde(default)]
    pub deleted_by: Option<String>,
    /// Hidden on this identity's devices
    #[serde(default)]
    pub deleted_for_me: bool,
    /// Clock of the edit currently shown, 0 if never edited
    #[serde(default)]
    pub edited_at: u64,
    /// Text as first received, kept once the message is edited
    #[serde(default)]
    pub original_text: Option<String>,
    /// Pinned in the chat
    #[serde(default)]
    pub pinned: bool,
    /// Who pinned it
    #[serde(default)]
    pub pinned_by: Option<String>,
    /// Group message whose sender was not a member at the message clock, as
    /// far as the known membership log tells
    #[serde(default)]
    pub withheld: bool,
}

impl Message {
    /// Create a new message
    pub fn new(
        id: String,
        chat_id: String,
        from: String,
        text: String,
        clock: u64,
        timestamp: u64,
    ) -> Self {
        Self {
            id,
            chat_id,
            clock,
            timestamp,
            from,
            text,
            response_to: None,
            seen: false,
            mentioned: false,
            deleted: false,
            deleted_by: None,
            deleted_for_me: false,
            edited_at: 0,
            original_text: None,
            pinned: false,
            pinned_by: None,
            withheld: false,
        }
    }

    /// Set the replied-to message
    pub fn with_response_to(mut self, response_to: Option<String>) -> Self {
        self.response_to = response_to;
        self
    }

    /// Whether the message is shown to the user
    pub fn is_visible(&self) -> bool {
        !self.deleted && !self.deleted_for_me && !self.withheld
    }

    /// Whether `text` mentions `public_key` (`@0x...`)
    pub fn text_mentions(text: &str, public_key: &str) -> bool {
        text.contains(&format!("@{}", public_key))
    }

    /// Contribution of this message to the chat's unread counters
    ///
    /// # Returns
    /// `(unviewed_messages, unviewed_mentions)`, each 0 or 1
    pub fn unread_weight(&self, me: &str) -> (u32, u32) {
        if self.seen || !self.is_visible() || self.from == me {
            return (0, 0);
        }
        (1, u32::from(self.mentioned))
    }
}

/// Clock-stamped mutation state of one message
///
/// Exists independently of the message: a delete, edit or pin may arrive
/// before the message itself and is kept here until it does. Deletes and
/// edits that arrive first are held per author, since who may make them is
/// only known once the message is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MessageMutations {
    /// Target message
    pub message_id: String,
    /// Chat of the target message
    pub chat_id: String,
    /// Delete-for-everyone tombstone, author is the deleter
    pub delete: Option<Register<bool>>,
    /// Delete-for-me tombstone
    pub delete_for_me: Option<Register<bool>>,
    /// Latest edit text, author is the editor
    pub edit: Option<Register<String>>,
    /// Pin flag, author is the pinner
    pub pin: Option<Register<bool>>,
    /// Deletes received before the message, by author
    #[serde(default)]
    pub pending_deletes: BTreeMap<String, Register<bool>>,
    /// Edits received before the message, by author
    #[serde(default)]
    pub pending_edits: BTreeMap<String, Register<String>>,
}

impl MessageMutations {
    /// Empty mutation state for a message
    pub fn new(message_id: &str, chat_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            chat_id: chat_id.to_string(),
            ..Default::default()
        }
    }

    /// Whether no mutation has been recorded
    pub fn is_empty(&self) -> bool {
        self.delete.is_none()
            && self.delete_for_me.is_none()
            && self.edit.is_none()
            && self.pin.is_none()
            && self.pending_deletes.is_empty()
            && self.pending_edits.is_empty()
    }
}
