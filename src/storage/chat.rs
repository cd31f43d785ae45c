//! Chat conversation state
//!
//! A chat owns its logical clock, its soft-delete fence, the denormalized last
//! message, unread counters and (for private groups) the membership log.
//! Everything here is synchronous; callers serialize access per chat ID.

use crate::clock::{self, ClockSource, MergeOutcome};
use crate::crypto::{self, PUBLIC_KEY_HEX_LEN};
use crate::protocol::{MembershipEvent, MembershipEventKind};
use crate::storage::message::Message;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Prefix of profile chat IDs
pub const PROFILE_PREFIX: &str = "@";
/// Prefix of timeline chat IDs
pub const TIMELINE_PREFIX: &str = "@timeline";

/// Kind of chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatType {
    /// Direct conversation with one peer
    OneToOne,
    /// Open, topic-named chat
    Public,
    /// Invitation-only group with an admin-controlled membership log
    PrivateGroup,
    /// A user's profile feed
    Profile,
    /// A user's timeline feed
    Timeline,
    /// Channel of a community
    CommunityChat,
}

/// Member of a private group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Public key
    pub id: String,
    /// Can change membership and name
    pub admin: bool,
    /// Accepted the invitation
    pub joined: bool,
}

/// Effect of applying a membership update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipChange {
    /// Whether the log grew
    pub outcome: MergeOutcome,
    /// The local identity went from not-joined to joined
    pub joined: bool,
    /// The local identity was a joined member and no longer is
    pub left: bool,
}

/// Represents a chat conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    /// Chat ID, shape depends on `chat_type`
    pub id: String,
    /// Kind of chat
    pub chat_type: ChatType,
    /// Display name
    pub name: String,
    /// Shown in the chat list
    pub active: bool,
    /// Wall time the chat was created locally (ms)
    pub timestamp: u64,
    /// Highest logical clock observed or emitted in this chat
    pub last_clock_value: u64,
    /// Soft-delete fence; inbound messages at or below it are discarded
    pub deleted_at_clock_value: u64,
    /// Message with the highest accepted clock, re-derivable from storage
    pub last_message: Option<Message>,
    /// Private group members keyed by public key
    #[serde(default)]
    pub members: BTreeMap<String, Member>,
    /// Private group membership log, sorted by `(clock, from)`
    #[serde(default)]
    pub membership_log: Vec<MembershipEvent>,
    /// Unread messages
    #[serde(default)]
    pub unviewed_messages_count: u32,
    /// Unread mentions
    #[serde(default)]
    pub unviewed_mentions_count: u32,
}

impl Chat {
    fn with_id(id: String, chat_type: ChatType, name: String, source: &dyn ClockSource) -> Self {
        Self {
            id,
            chat_type,
            name,
            active: true,
            timestamp: source.now_ms(),
            last_clock_value: 0,
            deleted_at_clock_value: 0,
            last_message: None,
            members: BTreeMap::new(),
            membership_log: Vec::new(),
            unviewed_messages_count: 0,
            unviewed_mentions_count: 0,
        }
    }

    /// Create a one-to-one chat with `public_key`
    pub fn one_to_one(public_key: &str, source: &dyn ClockSource) -> Result<Self> {
        crypto::validate_public_key(public_key)?;
        Ok(Self::with_id(
            public_key.to_string(),
            ChatType::OneToOne,
            public_key.to_string(),
            source,
        ))
    }

    /// Create a public chat named `name`
    pub fn public(name: &str, source: &dyn ClockSource) -> Result<Self> {
        validate_id(name, ChatType::Public)?;
        Ok(Self::with_id(name.to_string(), ChatType::Public, name.to_string(), source))
    }

    /// Create the profile chat of `public_key`
    pub fn profile(public_key: &str, source: &dyn ClockSource) -> Result<Self> {
        crypto::validate_public_key(public_key)?;
        let id = format!("{}{}", PROFILE_PREFIX, public_key);
        Ok(Self::with_id(id.clone(), ChatType::Profile, id, source))
    }

    /// Create the timeline chat of `public_key`
    pub fn timeline(public_key: &str, source: &dyn ClockSource) -> Result<Self> {
        crypto::validate_public_key(public_key)?;
        let id = format!("{}{}", TIMELINE_PREFIX, public_key);
        Ok(Self::with_id(id.clone(), ChatType::Timeline, id, source))
    }

    /// Create an empty private group owned by `owner`
    ///
    /// The ID is `<owner>-<uuid>`; the membership log starts empty and the
    /// chat stays inactive until a membership update joins the local user.
    pub fn private_group(owner: &str, source: &dyn ClockSource) -> Result<Self> {
        crypto::validate_public_key(owner)?;
        let id = format!("{}-{}", owner, uuid::Uuid::new_v4());
        Self::from_group_id(&id, source)
    }

    /// Placeholder for a private group first seen through a membership update
    pub fn from_group_id(id: &str, source: &dyn ClockSource) -> Result<Self> {
        validate_id(id, ChatType::PrivateGroup)?;
        let mut chat = Self::with_id(id.to_string(), ChatType::PrivateGroup, String::new(), source);
        chat.active = false;
        Ok(chat)
    }

    /// Create the chat of channel `channel_id` in community `community_id`
    pub fn community_chat(
        community_id: &str,
        channel_id: &str,
        source: &dyn ClockSource,
    ) -> Result<Self> {
        crypto::validate_public_key(community_id)?;
        if channel_id.is_empty() {
            return Err(Error::Validation("empty community channel ID".to_string()));
        }
        Ok(Self::with_id(
            community_chat_id(community_id, channel_id),
            ChatType::CommunityChat,
            channel_id.to_string(),
            source,
        ))
    }

    /// Advance the chat clock for a locally emitted event
    ///
    /// # Returns
    /// `(clock, timestamp_ms)`, with `clock` strictly greater than any clock
    /// this chat has seen
    pub fn next_clock_and_timestamp(&mut self, source: &dyn ClockSource) -> (u64, u64) {
        let (clock, timestamp) = clock::next_clock_and_timestamp(self.last_clock_value, source);
        self.last_clock_value = clock;
        (clock, timestamp)
    }

    /// Raise the chat clock to an observed clock
    pub fn observe_clock(&mut self, clock: u64) {
        if clock::newer(clock, self.last_clock_value) {
            self.last_clock_value = clock;
        }
    }

    /// Accept a message into the chat
    ///
    /// Messages at or below the soft-delete fence are discarded. Otherwise the
    /// message may become the last message (ties broken by message ID), raises
    /// the chat clock, and activates the chat when `activate` is set.
    pub fn apply_inbound_message(&mut self, message: &Message, activate: bool) -> MergeOutcome {
        if message.clock <= self.deleted_at_clock_value {
            return MergeOutcome::Stale;
        }

        self.offer_last_message(message);
        self.observe_clock(message.clock);

        if activate {
            self.active = true;
        }
        MergeOutcome::Applied
    }

    /// Offer a new or changed message as the chat's last message
    ///
    /// A visible message replaces the last message when its `(clock, id)` is
    /// not lower; the same message always replaces its older copy.
    ///
    /// # Returns
    /// `true` if the last message was hidden and has to be re-derived with
    /// [`Chat::refresh_last_message`]
    pub fn offer_last_message(&mut self, message: &Message) -> bool {
        let is_last = self.last_message.as_ref().is_some_and(|last| last.id == message.id);

        if !message.is_visible() {
            if is_last {
                self.last_message = None;
            }
            return is_last;
        }

        let replace = is_last
            || match &self.last_message {
                None => true,
                Some(last) => {
                    clock::compare(message.clock, &message.id, last.clock, &last.id)
                        != Ordering::Less
                }
            };
        if replace && message.clock > self.deleted_at_clock_value {
            self.last_message = Some(message.clone());
        }
        false
    }

    /// Replace the denormalized last message after it was hidden
    pub fn refresh_last_message(&mut self, candidate: Option<Message>) {
        self.last_message =
            candidate.filter(|m| m.clock > self.deleted_at_clock_value && m.is_visible());
    }

    /// Soft-delete the chat at a fresh clock
    ///
    /// # Returns
    /// The new deletion fence
    pub fn soft_delete(&mut self, source: &dyn ClockSource) -> u64 {
        let (clock, _) = self.next_clock_and_timestamp(source);
        self.apply_deleted_at(clock);
        clock
    }

    /// Apply a deletion fence (own action or synced from a paired device)
    pub fn apply_deleted_at(&mut self, clock: u64) -> MergeOutcome {
        if !clock::newer(clock, self.deleted_at_clock_value) {
            return MergeOutcome::Stale;
        }
        self.deleted_at_clock_value = clock;
        self.observe_clock(clock);
        self.active = false;
        self.last_message = None;
        self.unviewed_messages_count = 0;
        self.unviewed_mentions_count = 0;
        MergeOutcome::Applied
    }

    /// Move the unread counters from one message weight to another
    ///
    /// Decrements saturate at zero so counters that were reset externally
    /// never underflow.
    pub fn adjust_unread(&mut self, before: (u32, u32), after: (u32, u32)) {
        self.unviewed_messages_count = self
            .unviewed_messages_count
            .saturating_sub(before.0)
            .saturating_add(after.0);
        self.unviewed_mentions_count = self
            .unviewed_mentions_count
            .saturating_sub(before.1)
            .saturating_add(after.1);
    }

    /// Reset both unread counters
    pub fn mark_all_read(&mut self) {
        self.unviewed_messages_count = 0;
        self.unviewed_mentions_count = 0;
    }

    /// Whether `public_key` is a member that accepted the invitation
    pub fn is_joined_member(&self, public_key: &str) -> bool {
        self.members.get(public_key).is_some_and(|m| m.joined)
    }

    /// Whether `public_key` is an admin of the group
    pub fn is_admin(&self, public_key: &str) -> bool {
        self.members.get(public_key).is_some_and(|m| m.admin)
    }

    /// Whether `public_key` was a member of the group at `clock`
    ///
    /// Only log events at or below `clock` count. A group whose log has not
    /// arrived yet admits every sender until it does.
    ///
    /// # Errors
    /// `Error::Validation` if the log prefix does not fold
    pub fn was_member_at(&self, public_key: &str, clock: u64) -> Result<bool> {
        if self.membership_log.is_empty() {
            return Ok(true);
        }
        let known = self.membership_log.partition_point(|event| event.clock <= clock);
        if known == 0 {
            return Ok(false);
        }
        let (_, members) = fold_membership(&self.id, &self.membership_log[..known])?;
        Ok(members.contains_key(public_key))
    }

    /// Merge membership events into the group log and recompute membership
    ///
    /// The log is folded from scratch after every merge, so the result does
    /// not depend on the order updates arrive in. `me` is the local identity,
    /// used to detect the join/leave transitions.
    ///
    /// # Errors
    /// * `Error::Validation` - not a private group, malformed keys, or a log
    ///   that does not start with the group's creation
    /// * `Error::Authority` - an event whose author lacks the right to emit it
    pub fn apply_membership_events(
        &mut self,
        events: &[MembershipEvent],
        me: &str,
    ) -> Result<MembershipChange> {
        if self.chat_type != ChatType::PrivateGroup {
            return Err(Error::Validation(format!("chat {} is not a private group", self.id)));
        }

        let mut log = self.membership_log.clone();
        let mut grew = false;
        for event in events {
            crypto::validate_public_key(&event.from)?;
            if !log.contains(event) {
                log.push(event.clone());
                grew = true;
            }
        }
        if !grew {
            return Ok(MembershipChange {
                outcome: MergeOutcome::Stale,
                joined: false,
                left: false,
            });
        }
        log.sort_by(|a, b| a.clock.cmp(&b.clock).then_with(|| a.from.cmp(&b.from)));

        let (name, members) = fold_membership(&self.id, &log)?;

        let was_joined = self.is_joined_member(me);
        let now_joined = members.get(me).is_some_and(|m| m.joined);

        self.name = name;
        self.members = members;
        if let Some(max_clock) = log.iter().map(|e| e.clock).max() {
            self.observe_clock(max_clock);
        }
        self.membership_log = log;

        let joined = !was_joined && now_joined;
        let left = was_joined && !now_joined;
        if joined {
            self.active = true;
        }
        if left {
            self.active = false;
        }

        Ok(MembershipChange {
            outcome: MergeOutcome::Applied,
            joined,
            left,
        })
    }
}

/// Chat ID of a community channel
pub fn community_chat_id(community_id: &str, channel_id: &str) -> String {
    format!("{}{}", community_id, channel_id)
}

/// Validate a chat ID for its chat type
///
/// # Errors
/// `Error::Validation` describing the malformed part
pub fn validate_id(id: &str, chat_type: ChatType) -> Result<()> {
    match chat_type {
        ChatType::OneToOne => crypto::validate_public_key(id).map(|_| ()),
        ChatType::Public => {
            let well_formed = id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
            if id.is_empty() || !well_formed {
                return Err(Error::Validation(format!("invalid public chat name: {:?}", id)));
            }
            Ok(())
        }
        ChatType::Profile => {
            let key = id
                .strip_prefix(PROFILE_PREFIX)
                .ok_or_else(|| Error::Validation(format!("invalid profile chat ID: {}", id)))?;
            crypto::validate_public_key(key).map(|_| ())
        }
        ChatType::Timeline => {
            let key = id
                .strip_prefix(TIMELINE_PREFIX)
                .ok_or_else(|| Error::Validation(format!("invalid timeline chat ID: {}", id)))?;
            crypto::validate_public_key(key).map(|_| ())
        }
        ChatType::PrivateGroup => {
            group_owner(id)?;
            Ok(())
        }
        ChatType::CommunityChat => {
            if id.len() <= PUBLIC_KEY_HEX_LEN || !id.is_char_boundary(PUBLIC_KEY_HEX_LEN) {
                return Err(Error::Validation(format!("invalid community chat ID: {}", id)));
            }
            crypto::validate_public_key(&id[..PUBLIC_KEY_HEX_LEN]).map(|_| ())
        }
    }
}

/// Public key of the creator encoded in a private group ID
pub fn group_owner(id: &str) -> Result<&str> {
    let malformed = || Error::Validation(format!("invalid group chat ID: {}", id));
    if !id.is_char_boundary(PUBLIC_KEY_HEX_LEN) {
        return Err(malformed());
    }
    let (owner, suffix) = id.split_at(PUBLIC_KEY_HEX_LEN);
    let suffix = suffix.strip_prefix('-').ok_or_else(malformed)?;
    if suffix.is_empty() {
        return Err(malformed());
    }
    crypto::validate_public_key(owner)?;
    Ok(owner)
}

fn fold_membership(
    chat_id: &str,
    log: &[MembershipEvent],
) -> Result<(String, BTreeMap<String, Member>)> {
    let owner = group_owner(chat_id)?;
    let mut events = log.iter();

    let mut name = match events.next() {
        Some(MembershipEvent {
            from,
            kind: MembershipEventKind::ChatCreated { name },
            ..
        }) if from == owner => name.clone(),
        _ => {
            return Err(Error::Validation(format!(
                "membership log of {} does not start with its creation",
                chat_id
            )))
        }
    };

    let mut members = BTreeMap::new();
    members.insert(
        owner.to_string(),
        Member {
            id: owner.to_string(),
            admin: true,
            joined: true,
        },
    );

    let require_admin = |members: &BTreeMap<String, Member>, event: &MembershipEvent| {
        if members.get(&event.from).is_some_and(|m: &Member| m.admin) {
            Ok(())
        } else {
            Err(Error::Authority(format!("{} is not an admin of {}", event.from, chat_id)))
        }
    };

    for event in events {
        match &event.kind {
            MembershipEventKind::ChatCreated { .. } => {
                return Err(Error::Authority(format!("{} re-created {}", event.from, chat_id)));
            }
            MembershipEventKind::NameChanged { name: new_name } => {
                require_admin(&members, event)?;
                name = new_name.clone();
            }
            MembershipEventKind::MembersAdded { members: added } => {
                require_admin(&members, event)?;
                for id in added {
                    crypto::validate_public_key(id)?;
                    members.entry(id.clone()).or_insert_with(|| Member {
                        id: id.clone(),
                        admin: false,
                        joined: false,
                    });
                }
            }
            MembershipEventKind::MemberJoined => match members.get_mut(&event.from) {
                Some(member) => member.joined = true,
                None => {
                    return Err(Error::Authority(format!(
                        "{} joined {} without an invitation",
                        event.from, chat_id
                    )));
                }
            },
            MembershipEventKind::MemberLeft => {
                members.remove(&event.from);
            }
            MembershipEventKind::MemberRemoved { member } => {
                require_admin(&members, event)?;
                members.remove(member);
            }
            MembershipEventKind::AdminsAdded { members: promoted } => {
                require_admin(&members, event)?;
                for id in promoted {
                    match members.get_mut(id) {
                        Some(member) => member.admin = true,
                        None => {
                            return Err(Error::Validation(format!(
                                "{} is not a member of {}",
                                id, chat_id
                            )));
                        }
                    }
                }
            }
            MembershipEventKind::AdminRemoved { member } => {
                require_admin(&members, event)?;
                if let Some(member) = members.get_mut(member) {
                    member.admin = false;
                }
            }
        }
    }

    Ok((name, members))
}
