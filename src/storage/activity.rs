//! Activity center notification records

use crate::clock::{self, MergeOutcome};
use crate::crypto;
use serde::{Deserialize, Serialize};

/// Kind of notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    /// The local user was mentioned
    Mention,
    /// Someone replied to a message of the local user
    Reply,
    /// A peer sent a contact request
    ContactRequest,
    /// A peer asked to verify the local user's identity
    ContactVerification,
    /// A peer removed the local user from their contacts
    ContactRemoved,
    /// Someone asked to join a community we control
    CommunityRequestToJoin,
}

impl NotificationKind {
    /// Stable name used in notification IDs
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Mention => "mention",
            NotificationKind::Reply => "reply",
            NotificationKind::ContactRequest => "contact_request",
            NotificationKind::ContactVerification => "contact_verification",
            NotificationKind::ContactRemoved => "contact_removed",
            NotificationKind::CommunityRequestToJoin => "community_request_to_join",
        }
    }
}

/// Answer given to an actionable notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Resolution {
    /// Not answered yet
    #[default]
    Pending,
    /// Accepted
    Accepted,
    /// Dismissed
    Dismissed,
}

/// Activity center notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Stable ID derived from kind and subject
    pub id: String,
    /// What happened
    pub kind: NotificationKind,
    /// Identity that caused it
    pub author: String,
    /// Related chat
    pub chat_id: Option<String>,
    /// Related message
    pub message_id: Option<String>,
    /// Related community
    pub community_id: Option<String>,
    /// Wall time of the triggering event (ms)
    pub timestamp: u64,
    /// Clock of the last state change
    pub updated_at: u64,
    /// Read by the user
    pub read: bool,
    /// Accepted/dismissed state
    pub resolution: Resolution,
    /// Hidden because its subject went away (message deleted)
    pub deleted: bool,
}

impl Notification {
    /// Create a notification whose ID is derived from `kind` and `key`
    pub fn new(
        kind: NotificationKind,
        key: &str,
        author: &str,
        timestamp: u64,
        clock: u64,
    ) -> Self {
        Self {
            id: crypto::notification_id(kind.as_str(), key),
            kind,
            author: author.to_string(),
            chat_id: None,
            message_id: None,
            community_id: None,
            timestamp,
            updated_at: clock,
            read: false,
            resolution: Resolution::Pending,
            deleted: false,
        }
    }

    /// Attach the related chat and message
    pub fn for_message(mut self, chat_id: &str, message_id: &str) -> Self {
        self.chat_id = Some(chat_id.to_string());
        self.message_id = Some(message_id.to_string());
        self
    }

    /// Attach the related community
    pub fn for_community(mut self, community_id: &str) -> Self {
        self.community_id = Some(community_id.to_string());
        self
    }

    /// Whether the notification still asks for the user's attention
    pub fn is_unread(&self) -> bool {
        !self.read && !self.deleted
    }

    /// Apply a read/resolution change stamped with `clock`
    pub fn apply_state(
        &mut self,
        read: Option<bool>,
        resolution: Option<Resolution>,
        clock: u64,
    ) -> MergeOutcome {
        if !clock::newer(clock, self.updated_at) {
            return MergeOutcome::Stale;
        }
        if let Some(read) = read {
            self.read = read;
        }
        if let Some(resolution) = resolution {
            self.resolution = resolution;
            self.read = true;
        }
        self.updated_at = clock;
        MergeOutcome::Applied
    }
}

/// Activity center "has seen" cursor shared by an identity's devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ActivityCenterState {
    /// The activity center was opened since the last new notification
    pub has_seen: bool,
    /// Clock of the last change
    pub updated_at: u64,
}

impl ActivityCenterState {
    /// Last-writer-wins merge of the cursor
    pub fn merge(&mut self, has_seen: bool, updated_at: u64) -> MergeOutcome {
        if !clock::newer(updated_at, self.updated_at) {
            return MergeOutcome::Stale;
        }
        self.has_seen = has_seen;
        self.updated_at = updated_at;
        MergeOutcome::Applied
    }
}
