//! High-level messenger module
//!
//! `Messenger` is the reconciliation pipeline of one logged-in identity. It
//! combines the store, the merge engines and the transport:
//! - Local actions advance a chat or contact clock, merge the change locally,
//!   commit it, then broadcast the event
//! - Inbound envelopes are decoded, routed by event type, merged under the
//!   per-entity lock and committed in one transaction
//!
//! Locks are held for merge and commit only, never across a broadcast. Every
//! operation returns a [`Response`] with the entities it changed.

use crate::{
    activity,
    clock::{self, ClockSource, MergeOutcome, SystemClock},
    contacts::{self, ContactMergeResult},
    crypto::{self, HashRatchet, KeyPair, Keyring},
    keys::{self, Community, DistributionReport, EncryptionKeyActions, KeyExchangeSender},
    mutation::{self, MessageState, MutationEffect},
    protocol::{
        self, ChatMessage, CommunityRequestToJoin, ContactUpdate, ContactVerificationRequest,
        ContactVerificationResponse, Decoded, DeleteForMe, DeleteMessage, EditMessage, Envelope,
        Event, KeyExchange, MembershipEvent, MembershipEventKind, MembershipUpdate, Opened,
        PinMessage, SyncActivityCenterState, SyncActivityCenterUpdate, SyncClearHistory,
        SyncContact,
    },
    storage::{
        chat,
        store::{chat_key, contact_key, message_key, ACTIVITY_CENTER_KEY},
        ActivityCenterState, ChangeSet, Chat, ChatType, Contact, Message, Notification,
        NotificationKind, PropagatedState, Resolution, Settings, Storage, Store,
    },
    transport::Transport,
    Error, Response, Result,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex as AsyncMutex;

/// Mutation of an existing message
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mutation {
    Edit(String),
    Delete,
    DeleteForMe,
    Pin(bool),
}

/// Result of a message mutation pass
struct Mutated {
    response: Response,
    outcome: MergeOutcome,
    clock: u64,
    chat: Option<Chat>,
}

impl Mutated {
    fn stale(clock: u64) -> Self {
        Self {
            response: Response::new(),
            outcome: MergeOutcome::Stale,
            clock,
            chat: None,
        }
    }
}

/// Local change to a contact
#[derive(Debug, Clone, PartialEq, Eq)]
enum ContactAction {
    Send,
    Accept,
    Dismiss,
    Retract,
    Block(bool),
    EnsName(String),
    EnsVerified(bool),
}

/// Result of a local contact change
struct ContactChange {
    response: Response,
    contact: Contact,
    outcome: MergeOutcome,
    resolved: Option<(String, Resolution, u64)>,
}

/// Reconciliation pipeline of one identity
///
/// Created at login and dropped at logout; the store and its caches live
/// exactly as long as the messenger.
pub struct Messenger<T: Transport> {
    identity: KeyPair,
    me: String,
    store: Store,
    transport: T,
    ratchet: Arc<dyn HashRatchet>,
    clock: Arc<dyn ClockSource>,
    settings: Settings,
    communities: RwLock<HashMap<String, Community>>,
    /// Group ciphertext waiting for its key, by group ID
    held: AsyncMutex<HashMap<String, Vec<Envelope>>>,
    history_cursor: AsyncMutex<Option<String>>,
}

impl<T: Transport> Messenger<T> {
    /// Create a messenger for `identity` over an opened database
    ///
    /// # Arguments
    /// * `identity` - Key pair of the logged-in user
    /// * `storage` - Database of this identity
    /// * `transport` - Broadcast transport
    /// * `ratchet` - Group-key collaborator
    /// * `clock` - Wall-clock source
    /// * `settings` - Reconciliation settings
    pub fn new(
        identity: KeyPair,
        storage: Storage,
        transport: T,
        ratchet: Arc<dyn HashRatchet>,
        clock: Arc<dyn ClockSource>,
        settings: Settings,
    ) -> Result<Self> {
        storage.save_user_identity(&identity)?;
        let store = Store::open(storage)?;
        let me = identity.public_key_hex();
        tracing::info!("Messenger started for {}", me);

        Ok(Self {
            identity,
            me,
            store,
            transport,
            ratchet,
            clock,
            settings,
            communities: RwLock::new(HashMap::new()),
            held: AsyncMutex::new(HashMap::new()),
            history_cursor: AsyncMutex::new(None),
        })
    }

    /// Open the database under `settings.storage_path`, creating an identity
    /// on first use
    pub fn open(settings: Settings, transport: T) -> Result<Self> {
        std::fs::create_dir_all(&settings.storage_path)?;
        let storage = Storage::new(settings.database_path())?;
        let identity = match storage.load_user_identity()? {
            Some(identity) => identity,
            None => {
                tracing::info!("No identity found, generating one");
                KeyPair::generate()?
            }
        };
        Self::new(
            identity,
            storage,
            transport,
            Arc::new(Keyring::new()),
            Arc::new(SystemClock),
            settings,
        )
    }

    /// Public key of the local identity
    pub fn public_key(&self) -> &str {
        &self.me
    }

    /// Underlying store
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Active settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Visible messages of a chat above its deletion fence, oldest first
    pub fn chat_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        let chat = self
            .store
            .chat(chat_id)?
            .ok_or_else(|| Error::NotFound(format!("chat {}", chat_id)))?;
        Ok(self
            .store
            .messages_for_chat(chat_id)?
            .into_iter()
            .filter(|m| m.is_visible() && m.clock > chat.deleted_at_clock_value)
            .collect())
    }

    /// Make a community known, for key receipt and join requests
    pub fn register_community(&self, community: Community) -> Result<()> {
        crypto::validate_public_key(&community.id)?;
        crypto::validate_public_key(&community.control_node)?;
        self.communities
            .write()
            .map_err(|_| Error::Storage("community registry poisoned".to_string()))?
            .insert(community.id.clone(), community);
        Ok(())
    }

    /// Registered community by ID
    pub fn community(&self, community_id: &str) -> Result<Option<Community>> {
        Ok(self
            .communities
            .read()
            .map_err(|_| Error::Storage("community registry poisoned".to_string()))?
            .get(community_id)
            .cloned())
    }

    // ---------------------------------------------------------------------
    // Publishing
    // ---------------------------------------------------------------------

    async fn broadcast_envelope(&self, topic: &str, envelope: &Envelope) -> Result<String> {
        let hash = self.transport.broadcast(topic, envelope.to_cbor()?).await?;
        tracing::debug!("Published on {} ({})", topic, hash);
        Ok(hash)
    }

    async fn publish(&self, topic: &str, event: &Event) -> Result<String> {
        let envelope = Envelope::seal(&self.identity, event)?;
        self.broadcast_envelope(topic, &envelope).await
    }

    /// Hash-ratchet group a chat's events are sealed for, if encrypted
    fn group_for(&self, chat: &Chat) -> Result<Option<String>> {
        if chat.chat_type != ChatType::CommunityChat {
            return Ok(None);
        }
        if self.ratchet.current_key(&chat.id)?.is_some() {
            return Ok(Some(chat.id.clone()));
        }
        let Some(community_id) = chat.id.get(..crypto::PUBLIC_KEY_HEX_LEN) else {
            return Ok(None);
        };
        if self.ratchet.current_key(community_id)?.is_some() {
            return Ok(Some(community_id.to_string()));
        }
        Ok(None)
    }

    fn topic_for(chat: &Chat) -> String {
        match chat.chat_type {
            ChatType::OneToOne => protocol::contact_topic(&chat.id),
            _ => protocol::chat_topic(&chat.id),
        }
    }

    async fn publish_in_chat(&self, chat: &Chat, event: &Event) -> Result<String> {
        let envelope = match self.group_for(chat)? {
            Some(group_id) => {
                Envelope::seal_for_group(&self.identity, event, &*self.ratchet, &group_id)?
            }
            None => Envelope::seal(&self.identity, event)?,
        };
        self.broadcast_envelope(&Self::topic_for(chat), &envelope).await
    }

    async fn publish_sync(&self, event: &Event) -> Result<String> {
        self.publish(&protocol::sync_topic(&self.me), event).await
    }

    fn sync_contact_event(contact: &Contact) -> Event {
        Event::SyncContact(SyncContact {
            contact_id: contact.id.clone(),
            state: contact.propagated_state(),
            blocked: contact.blocked,
            blocked_clock: contact.blocked_clock,
            ens_name: contact
                .ens_name
                .clone()
                .map(|name| (name, contact.last_ens_clock_value)),
        })
    }

    /// Send our view of the relationship to the peer
    async fn send_contact_update(&self, contact: &Contact) -> Result<()> {
        let event = Event::ContactUpdate(ContactUpdate {
            clock: contact.last_updated,
            display_name: self.settings.display_name.clone(),
            state: contact.propagated_state(),
        });
        self.publish(&protocol::contact_topic(&contact.id), &event).await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Activity center staging
    // ---------------------------------------------------------------------

    fn unseen_activity_state(&self) -> Result<ActivityCenterState> {
        let mut state = self.store.activity_state()?;
        let (clock, _) = clock::next_clock_and_timestamp(state.updated_at, &*self.clock);
        state.merge(false, clock);
        Ok(state)
    }

    /// Merge a projected notification with the stored one into `changes`
    fn stage_notification(
        &self,
        changes: &mut ChangeSet,
        notification: Notification,
    ) -> Result<()> {
        if !self.settings.enable_notifications {
            return Ok(());
        }
        let existing = self.store.notification(&notification.id)?;
        let (merged, outcome) = activity::merge(existing, notification);
        if outcome.is_applied() {
            tracing::debug!("Notification {} ({}) updated", merged.id, merged.kind.as_str());
            changes.notifications.push(merged);
            changes.activity_state = Some(self.unseen_activity_state()?);
        }
        Ok(())
    }

    fn stage_hidden_notifications(
        &self,
        changes: &mut ChangeSet,
        message_id: &str,
        kinds: &[NotificationKind],
        clock: u64,
    ) -> Result<()> {
        for kind in kinds {
            let id = crypto::notification_id(kind.as_str(), message_id);
            if let Some(mut notification) = self.store.notification(&id)? {
                if activity::hide(&mut notification, clock).is_applied() {
                    changes.notifications.push(notification);
                }
            }
        }
        Ok(())
    }

    fn stage_message_notifications(
        &self,
        changes: &mut ChangeSet,
        message: &Message,
    ) -> Result<()> {
        let replied_to = match &message.response_to {
            Some(id) => self.store.message(id)?,
            None => None,
        };
        for notification in activity::for_message(message, replied_to.as_ref(), &self.me) {
            self.stage_notification(changes, notification)?;
        }
        Ok(())
    }

    fn stage_read_notifications(&self, changes: &mut ChangeSet, message_id: &str) -> Result<()> {
        for kind in [NotificationKind::Mention, NotificationKind::Reply] {
            let id = crypto::notification_id(kind.as_str(), message_id);
            if let Some(mut notification) = self.store.notification(&id)? {
                let (clock, _) =
                    clock::next_clock_and_timestamp(notification.updated_at, &*self.clock);
                if activity::mark_read(&mut notification, clock).is_applied() {
                    changes.notifications.push(notification);
                }
            }
        }
        Ok(())
    }

    fn commit(&self, changes: ChangeSet) -> Result<Response> {
        let mut response = Response::new();
        if changes.is_empty() {
            return Ok(response);
        }
        self.store.commit(&changes)?;
        response.record(changes);
        Ok(response)
    }

    // ---------------------------------------------------------------------
    // Chats
    // ---------------------------------------------------------------------

    async fn open_chat(&self, chat: Chat) -> Result<Response> {
        let _guard = self.store.locks().lock(&chat_key(&chat.id)).await?;
        let chat = match self.store.chat(&chat.id)? {
            Some(existing) if existing.active => return Ok(Response::new()),
            Some(mut existing) => {
                existing.active = true;
                existing
            }
            None => chat,
        };
        tracing::info!("Opened chat {}", chat.id);
        self.commit(ChangeSet {
            chats: vec![chat],
            ..Default::default()
        })
    }

    /// Start (or re-open) a one-to-one chat with `public_key`
    pub async fn create_one_to_one_chat(&self, public_key: &str) -> Result<Response> {
        if public_key == self.me {
            return Err(Error::Validation("cannot open a chat with yourself".to_string()));
        }
        self.open_chat(Chat::one_to_one(public_key, &*self.clock)?).await
    }

    /// Join (or re-open) the public chat `name`
    pub async fn join_public_chat(&self, name: &str) -> Result<Response> {
        self.open_chat(Chat::public(name, &*self.clock)?).await
    }

    /// Open the chat of a community channel
    pub async fn join_community_chat(
        &self,
        community_id: &str,
        channel_id: &str,
    ) -> Result<Response> {
        self.open_chat(Chat::community_chat(community_id, channel_id, &*self.clock)?)
            .await
    }

    /// Soft-delete a chat
    ///
    /// Everything at or below the new fence stays hidden, also when it is
    /// re-delivered later. The fence is replicated to paired devices.
    pub async fn soft_delete_chat(&self, chat_id: &str) -> Result<Response> {
        let guard = self.store.locks().lock(&chat_key(chat_id)).await?;
        let mut chat = self
            .store
            .chat(chat_id)?
            .ok_or_else(|| Error::NotFound(format!("chat {}", chat_id)))?;
        let fence = chat.soft_delete(&*self.clock);
        let response = self.commit(ChangeSet {
            chats: vec![chat],
            ..Default::default()
        })?;
        drop(guard);

        tracing::info!("Chat {} deleted up to clock {}", chat_id, fence);
        self.publish_sync(&Event::SyncClearHistory(SyncClearHistory {
            chat_id: chat_id.to_string(),
            clock: fence,
        }))
        .await?;
        Ok(response)
    }

    /// Create a private group with `members` invited
    pub async fn create_group_chat(&self, name: &str, members: &[String]) -> Result<Response> {
        for member in members {
            crypto::validate_public_key(member)?;
        }

        let mut chat = Chat::private_group(&self.me, &*self.clock)?;
        let guard = self.store.locks().lock(&chat_key(&chat.id)).await?;

        let (created_at, _) = chat.next_clock_and_timestamp(&*self.clock);
        let mut events = vec![MembershipEvent::signed(
            &self.identity,
            &chat.id,
            created_at,
            MembershipEventKind::ChatCreated { name: name.to_string() },
        )?];
        if !members.is_empty() {
            let (added_at, _) = chat.next_clock_and_timestamp(&*self.clock);
            events.push(MembershipEvent::signed(
                &self.identity,
                &chat.id,
                added_at,
                MembershipEventKind::MembersAdded {
                    members: members.to_vec(),
                },
            )?);
        }
        chat.apply_membership_events(&events, &self.me)?;

        let update = MembershipUpdate {
            chat_id: chat.id.clone(),
            events: chat.membership_log.clone(),
        };
        let response = self.commit(ChangeSet {
            chats: vec![chat.clone()],
            ..Default::default()
        })?;
        drop(guard);

        tracing::info!("Created group {} with {} invited members", chat.id, members.len());
        self.publish_in_chat(&chat, &Event::MembershipUpdate(update)).await?;
        Ok(response)
    }

    async fn update_membership(
        &self,
        chat_id: &str,
        kind: MembershipEventKind,
    ) -> Result<Response> {
        let guard = self.store.locks().lock(&chat_key(chat_id)).await?;
        let mut chat = self
            .store
            .chat(chat_id)?
            .ok_or_else(|| Error::NotFound(format!("chat {}", chat_id)))?;

        let (clock, _) = chat.next_clock_and_timestamp(&*self.clock);
        let event = MembershipEvent::signed(&self.identity, chat_id, clock, kind)?;
        chat.apply_membership_events(std::slice::from_ref(&event), &self.me)?;

        let update = MembershipUpdate {
            chat_id: chat.id.clone(),
            events: chat.membership_log.clone(),
        };
        let mut changes = ChangeSet::default();
        self.stage_membership_gate(&mut chat, &mut changes)?;
        changes.chats.push(chat.clone());
        let response = self.commit(changes)?;
        drop(guard);

        self.publish_in_chat(&chat, &Event::MembershipUpdate(update)).await?;
        Ok(response)
    }

    /// Invite `members` to a private group (admins only)
    pub async fn add_group_members(&self, chat_id: &str, members: &[String]) -> Result<Response> {
        self.update_membership(
            chat_id,
            MembershipEventKind::MembersAdded {
                members: members.to_vec(),
            },
        )
        .await
    }

    /// Remove `member` from a private group (admins only)
    pub async fn remove_group_member(&self, chat_id: &str, member: &str) -> Result<Response> {
        self.update_membership(
            chat_id,
            MembershipEventKind::MemberRemoved {
                member: member.to_string(),
            },
        )
        .await
    }

    /// Rename a private group (admins only)
    pub async fn rename_group_chat(&self, chat_id: &str, name: &str) -> Result<Response> {
        self.update_membership(chat_id, MembershipEventKind::NameChanged { name: name.to_string() })
            .await
    }

    /// Accept an invitation to a private group
    pub async fn join_group_chat(&self, chat_id: &str) -> Result<Response> {
        self.update_membership(chat_id, MembershipEventKind::MemberJoined).await
    }

    /// Leave a private group
    pub async fn leave_group_chat(&self, chat_id: &str) -> Result<Response> {
        self.update_membership(chat_id, MembershipEventKind::MemberLeft).await
    }

    // ---------------------------------------------------------------------
    // Messages
    // ---------------------------------------------------------------------

    /// Send a text message to a chat
    ///
    /// The message is committed locally before it is broadcast; a transport
    /// failure is returned to the caller but does not undo the local message.
    pub async fn send_chat_message(
        &self,
        chat_id: &str,
        text: &str,
        response_to: Option<&str>,
    ) -> Result<Response> {
        if text.trim().is_empty() {
            return Err(Error::Validation("empty message".to_string()));
        }

        let guard = self.store.locks().lock(&chat_key(chat_id)).await?;
        let mut chat = self
            .store
            .chat(chat_id)?
            .ok_or_else(|| Error::NotFound(format!("chat {}", chat_id)))?;
        if chat.chat_type == ChatType::PrivateGroup && !chat.is_joined_member(&self.me) {
            return Err(Error::Authority(format!("{} is not a member of {}", self.me, chat_id)));
        }

        let contact_state = match chat.chat_type {
            ChatType::OneToOne => Some(
                self.store
                    .contact(chat_id)?
                    .map(|contact| contact.propagated_state())
                    .unwrap_or_default(),
            ),
            _ => None,
        };

        let (clock, timestamp) = chat.next_clock_and_timestamp(&*self.clock);
        let event = Event::ChatMessage(ChatMessage {
            chat_id: chat.id.clone(),
            chat_type: chat.chat_type,
            clock,
            timestamp,
            text: text.to_string(),
            response_to: response_to.map(str::to_string),
            contact_state,
        });
        let message_id = Envelope::message_id_for(&self.me, &event)?;
        let message = Message::new(
            message_id.clone(),
            chat.id.clone(),
            self.me.clone(),
            text.to_string(),
            clock,
            timestamp,
        )
        .with_response_to(response_to.map(str::to_string));

        let mut state = MessageState::new(None, self.store.mutations(&message_id, chat_id)?);
        mutation::ingest(&mut state, message, &mut chat, &self.me, true);

        let mut changes = ChangeSet {
            chats: vec![chat.clone()],
            ..Default::default()
        };
        changes.messages.extend(state.message);
        let response = self.commit(changes)?;
        drop(guard);

        tracing::info!("Sending message {} to {}", message_id, chat_id);
        self.publish_in_chat(&chat, &event).await?;
        Ok(response)
    }

    /// Apply a message mutation under the chat and message locks
    ///
    /// `clock` is `None` for local actions, which take a fresh clock from
    /// the chat and require the message to be known.
    async fn mutate_message(
        &self,
        author: &str,
        chat_id: &str,
        message_id: &str,
        clock: Option<u64>,
        change: &Mutation,
    ) -> Result<Mutated> {
        let _guards = self
            .store
            .locks()
            .lock_all(&[chat_key(chat_id), message_key(message_id)])
            .await?;

        let mut chat = self.store.chat(chat_id)?;
        let message = self.store.message(message_id)?;
        if message.as_ref().is_some_and(|m| m.chat_id != chat_id) {
            return Err(Error::Validation(format!(
                "message {} does not belong to chat {}",
                message_id, chat_id
            )));
        }
        let mut state = MessageState::new(message, self.store.mutations(message_id, chat_id)?);

        let clock = match clock {
            Some(clock) => {
                if let Some(chat) = chat.as_mut() {
                    if clock <= chat.deleted_at_clock_value {
                        tracing::debug!(
                            "Mutation of {} at {} is below the deletion fence",
                            message_id,
                            clock,
                        );
                        return Ok(Mutated::stale(clock));
                    }
                    chat.observe_clock(clock);
                }
                clock
            }
            None => {
                if state.message.is_none() {
                    return Err(Error::NotFound(format!("message {}", message_id)));
                }
                let chat = chat
                    .as_mut()
                    .ok_or_else(|| Error::NotFound(format!("chat {}", chat_id)))?;
                chat.next_clock_and_timestamp(&*self.clock).0
            }
        };

        let me = self.me.as_str();
        let effect: MutationEffect = match change {
            Mutation::Edit(text) => {
                mutation::apply_edit(&mut state, chat.as_mut(), author, text, clock, me)?
            }
            Mutation::Delete => {
                mutation::apply_delete(&mut state, chat.as_mut(), author, clock, me)?
            }
            Mutation::DeleteForMe => {
                mutation::apply_delete_for_me(&mut state, chat.as_mut(), author, clock, me)?
            }
            Mutation::Pin(pinned) => {
                mutation::apply_pin(&mut state, chat.as_mut(), author, *pinned, clock, me)
            }
        };
        if !effect.outcome.is_applied() {
            return Ok(Mutated::stale(clock));
        }

        if effect.last_message_cleared {
            if let Some(chat) = chat.as_mut() {
                chat.refresh_last_message(self.store.latest_visible_message(chat_id, message_id)?);
            }
        }

        let mut changes = ChangeSet::default();
        if let Some(message) = &state.message {
            if effect.hidden {
                self.stage_hidden_notifications(
                    &mut changes,
                    message_id,
                    &[NotificationKind::Mention, NotificationKind::Reply],
                    clock,
                )?;
            } else if effect.mention_removed {
                self.stage_hidden_notifications(
                    &mut changes,
                    message_id,
                    &[NotificationKind::Mention],
                    clock,
                )?;
            }
            if effect.resurfaced || effect.mention_added {
                self.stage_message_notifications(&mut changes, message)?;
            }
            changes.messages.push(message.clone());
        }
        changes.mutations.push(state.mutations);
        changes.chats.extend(chat.clone());

        let mut response = self.commit(changes)?;
        if effect.hidden {
            response.remove_message(message_id);
        }

        Ok(Mutated {
            response,
            outcome: MergeOutcome::Applied,
            clock,
            chat,
        })
    }

    async fn local_mutation(&self, message_id: &str, change: Mutation) -> Result<Mutated> {
        let message = self
            .store
            .message(message_id)?
            .ok_or_else(|| Error::NotFound(format!("message {}", message_id)))?;
        let me = self.me.clone();
        self.mutate_message(&me, &message.chat_id, message_id, None, &change)
            .await
    }

    /// Edit one of our own messages
    pub async fn edit_message(&self, message_id: &str, text: &str) -> Result<Response> {
        if text.trim().is_empty() {
            return Err(Error::Validation("empty message".to_string()));
        }
        let mutated = self.local_mutation(message_id, Mutation::Edit(text.to_string())).await?;
        if let (MergeOutcome::Applied, Some(chat)) = (mutated.outcome, &mutated.chat) {
            let event = Event::EditMessage(EditMessage {
                chat_id: chat.id.clone(),
                message_id: message_id.to_string(),
                clock: mutated.clock,
                text: text.to_string(),
            });
            self.publish_in_chat(chat, &event).await?;
        }
        Ok(mutated.response)
    }

    /// Delete a message for everyone (its sender, or a group admin)
    pub async fn delete_message(&self, message_id: &str) -> Result<Response> {
        let mutated = self.local_mutation(message_id, Mutation::Delete).await?;
        if let (MergeOutcome::Applied, Some(chat)) = (mutated.outcome, &mutated.chat) {
            let event = Event::DeleteMessage(DeleteMessage {
                chat_id: chat.id.clone(),
                message_id: message_id.to_string(),
                clock: mutated.clock,
            });
            self.publish_in_chat(chat, &event).await?;
        }
        Ok(mutated.response)
    }

    /// Hide a message on all devices of the local identity
    pub async fn delete_message_for_me(&self, message_id: &str) -> Result<Response> {
        let mutated = self.local_mutation(message_id, Mutation::DeleteForMe).await?;
        if let (MergeOutcome::Applied, Some(chat)) = (mutated.outcome, &mutated.chat) {
            let event = Event::DeleteForMe(DeleteForMe {
                chat_id: chat.id.clone(),
                message_id: message_id.to_string(),
                clock: mutated.clock,
            });
            self.publish_sync(&event).await?;
        }
        Ok(mutated.response)
    }

    /// Pin or unpin a message
    pub async fn pin_message(&self, message_id: &str, pinned: bool) -> Result<Response> {
        let mutated = self.local_mutation(message_id, Mutation::Pin(pinned)).await?;
        if let (MergeOutcome::Applied, Some(chat)) = (mutated.outcome, &mutated.chat) {
            let event = Event::PinMessage(PinMessage {
                chat_id: chat.id.clone(),
                message_id: message_id.to_string(),
                clock: mutated.clock,
                pinned,
            });
            self.publish_in_chat(chat, &event).await?;
        }
        Ok(mutated.response)
    }

    /// Mark messages of a chat as seen, with their mention/reply notifications
    pub async fn mark_messages_seen(
        &self,
        chat_id: &str,
        message_ids: &[String],
    ) -> Result<Response> {
        let mut keys = vec![chat_key(chat_id)];
        keys.extend(message_ids.iter().map(|id| message_key(id)));
        let _guards = self.store.locks().lock_all(&keys).await?;

        let mut chat = self
            .store
            .chat(chat_id)?
            .ok_or_else(|| Error::NotFound(format!("chat {}", chat_id)))?;

        let mut changes = ChangeSet::default();
        for id in message_ids {
            let Some(mut message) = self.store.message(id)? else {
                continue;
            };
            if message.chat_id != chat_id {
                continue;
            }
            if mutation::mark_seen(&mut message, &mut chat, &self.me).is_applied() {
                changes.messages.push(message);
            }
            self.stage_read_notifications(&mut changes, id)?;
        }
        if changes.is_empty() {
            return Ok(Response::new());
        }
        changes.chats.push(chat);
        self.commit(changes)
    }

    /// Mark a message unread again
    pub async fn mark_message_unread(&self, message_id: &str) -> Result<Response> {
        let chat_id = self
            .store
            .message(message_id)?
            .ok_or_else(|| Error::NotFound(format!("message {}", message_id)))?
            .chat_id;
        let _guards = self
            .store
            .locks()
            .lock_all(&[chat_key(&chat_id), message_key(message_id)])
            .await?;

        let (Some(mut message), Some(mut chat)) =
            (self.store.message(message_id)?, self.store.chat(&chat_id)?)
        else {
            return Err(Error::NotFound(format!("message {}", message_id)));
        };
        if !mutation::mark_unread(&mut message, &mut chat, &self.me).is_applied() {
            return Ok(Response::new());
        }
        self.commit(ChangeSet {
            chats: vec![chat],
            messages: vec![message],
            ..Default::default()
        })
    }

    // ---------------------------------------------------------------------
    // Contacts
    // ---------------------------------------------------------------------

    async fn update_contact(
        &self,
        public_key: &str,
        action: ContactAction,
    ) -> Result<ContactChange> {
        crypto::validate_public_key(public_key)?;
        if public_key == self.me {
            return Err(Error::Validation("cannot add yourself as a contact".to_string()));
        }

        let _guards = self
            .store
            .locks()
            .lock_all(&[contact_key(public_key), chat_key(public_key)])
            .await?;

        let mut contact = match self.store.contact(public_key)? {
            Some(contact) => contact,
            None => Contact::new(public_key)?,
        };
        let (clock, timestamp) =
            clock::next_clock_and_timestamp(contact.last_updated, &*self.clock);
        let request_id =
            crypto::notification_id(NotificationKind::ContactRequest.as_str(), public_key);

        let mut changes = ChangeSet::default();
        let mut resolved = None;
        let outcome = match &action {
            ContactAction::Send | ContactAction::Accept => {
                let result: ContactMergeResult = contacts::send_request(&mut contact, clock);
                let mut chat = match self.store.chat(public_key)? {
                    Some(chat) => chat,
                    None => Chat::one_to_one(public_key, &*self.clock)?,
                };
                chat.active = true;
                changes.chats.push(chat);
                if action == ContactAction::Accept {
                    resolved = Some((request_id.clone(), Resolution::Accepted, clock));
                }
                result.outcome
            }
            ContactAction::Dismiss => {
                resolved = Some((request_id.clone(), Resolution::Dismissed, clock));
                contacts::dismiss_request(&mut contact, clock).outcome
            }
            ContactAction::Retract => contacts::retract_request(&mut contact, clock).outcome,
            ContactAction::Block(blocked) => {
                let outcome = contacts::set_blocked(&mut contact, *blocked, clock);
                if *blocked {
                    if let Some(mut chat) = self.store.chat(public_key)? {
                        chat.active = false;
                        changes.chats.push(chat);
                    }
                    if let Some(mut request) = self.store.notification(&request_id)? {
                        if activity::hide(&mut request, clock).is_applied() {
                            changes.notifications.push(request);
                        }
                    }
                }
                outcome
            }
            ContactAction::EnsName(name) => contacts::set_ens_name(&mut contact, name, clock),
            ContactAction::EnsVerified(verified) => {
                if contact.ens_name.is_none() {
                    return Err(Error::NotFound(format!("ENS name of {}", public_key)));
                }
                contact.record_ens_verification(*verified, timestamp);
                MergeOutcome::Applied
            }
        };

        if let Some((id, resolution, clock)) = &resolved {
            if let Some(mut request) = self.store.notification(id)? {
                if activity::resolve(&mut request, *resolution, *clock).is_applied() {
                    changes.notifications.push(request);
                }
            }
        }

        if outcome.is_applied() {
            changes.contacts.push(contact.clone());
        }
        let response = self.commit(changes)?;

        tracing::debug!("Contact {} after {:?}: {:?}", public_key, action, contact.relationship());
        Ok(ContactChange {
            response,
            contact,
            outcome,
            resolved,
        })
    }

    async fn publish_contact_change(&self, change: &ContactChange, to_peer: bool) -> Result<()> {
        if !change.outcome.is_applied() {
            return Ok(());
        }
        if to_peer {
            self.send_contact_update(&change.contact).await?;
        }
        self.publish_sync(&Self::sync_contact_event(&change.contact)).await?;
        if let Some((id, resolution, clock)) = &change.resolved {
            self.publish_sync(&Event::SyncActivityCenterUpdate(SyncActivityCenterUpdate {
                ids: vec![id.clone()],
                clock: *clock,
                read: None,
                resolution: Some(*resolution),
            }))
            .await?;
        }
        Ok(())
    }

    /// Send a contact request to `public_key`
    pub async fn send_contact_request(&self, public_key: &str) -> Result<Response> {
        let change = self.update_contact(public_key, ContactAction::Send).await?;
        tracing::info!("Contact request sent to {}", public_key);
        self.publish_contact_change(&change, true).await?;
        Ok(change.response)
    }

    /// Accept the pending request of `public_key`
    pub async fn accept_contact_request(&self, public_key: &str) -> Result<Response> {
        self.require_pending_request(public_key)?;
        let change = self.update_contact(public_key, ContactAction::Accept).await?;
        tracing::info!("Contact request from {} accepted", public_key);
        self.publish_contact_change(&change, true).await?;
        Ok(change.response)
    }

    /// Decline the pending request of `public_key`
    pub async fn decline_contact_request(&self, public_key: &str) -> Result<Response> {
        self.require_pending_request(public_key)?;
        let change = self.update_contact(public_key, ContactAction::Dismiss).await?;
        tracing::info!("Contact request from {} declined", public_key);
        self.publish_contact_change(&change, false).await?;
        Ok(change.response)
    }

    fn require_pending_request(&self, public_key: &str) -> Result<()> {
        match self.store.contact(public_key)? {
            Some(contact) if contact.pending_incoming() => Ok(()),
            _ => Err(Error::NotFound(format!("contact request from {}", public_key))),
        }
    }

    /// Remove `public_key` from our contacts, retracting any request
    pub async fn retract_contact_request(&self, public_key: &str) -> Result<Response> {
        let change = self.update_contact(public_key, ContactAction::Retract).await?;
        tracing::info!("Contact {} removed", public_key);
        self.publish_contact_change(&change, true).await?;
        Ok(change.response)
    }

    /// Block `public_key`; its events are dropped from now on
    pub async fn block_contact(&self, public_key: &str) -> Result<Response> {
        let change = self.update_contact(public_key, ContactAction::Block(true)).await?;
        tracing::info!("Contact {} blocked", public_key);
        self.publish_contact_change(&change, false).await?;
        Ok(change.response)
    }

    /// Unblock `public_key`
    pub async fn unblock_contact(&self, public_key: &str) -> Result<Response> {
        let change = self.update_contact(public_key, ContactAction::Block(false)).await?;
        self.publish_contact_change(&change, false).await?;
        Ok(change.response)
    }

    /// Record the ENS name `public_key` claims
    pub async fn set_contact_ens_name(&self, public_key: &str, name: &str) -> Result<Response> {
        if name.is_empty() {
            return Err(Error::Validation("empty ENS name".to_string()));
        }
        let change = self
            .update_contact(public_key, ContactAction::EnsName(name.to_string()))
            .await?;
        self.publish_contact_change(&change, false).await?;
        Ok(change.response)
    }

    /// Contacts whose ENS name should be verified now
    pub fn ens_names_due_for_verification(&self) -> Result<Vec<Contact>> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .contacts()?
            .into_iter()
            .filter(|contact| {
                contact.ens_verification_due(
                    now,
                    self.settings.ens_verification_backoff_ms,
                    self.settings.ens_max_verification_retries,
                )
            })
            .collect())
    }

    /// Record the outcome of an ENS verification of `public_key`
    pub async fn record_ens_verification(
        &self,
        public_key: &str,
        verified: bool,
    ) -> Result<Response> {
        let change = self
            .update_contact(public_key, ContactAction::EnsVerified(verified))
            .await?;
        Ok(change.response)
    }

    /// Contact requests waiting for an answer
    pub fn pending_contact_requests(&self) -> Result<Vec<Notification>> {
        let notifications = self.store.notifications()?;
        Ok(contacts::pending_requests(&notifications, &self.me)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Ask a mutual contact to verify their identity
    pub async fn request_contact_verification(
        &self,
        public_key: &str,
        challenge: &str,
    ) -> Result<Response> {
        match self.store.contact(public_key)? {
            Some(contact) if contact.mutual() => {}
            _ => {
                return Err(Error::Authority(format!(
                    "{} is not a mutual contact",
                    public_key
                )))
            }
        }
        let event = Event::ContactVerificationRequest(ContactVerificationRequest {
            clock: self.clock.now_ms(),
            challenge: challenge.to_string(),
        });
        self.publish(&protocol::contact_topic(public_key), &event).await?;
        Ok(Response::new())
    }

    /// Answer the verification request of `public_key`
    pub async fn respond_contact_verification(
        &self,
        public_key: &str,
        accepted: bool,
        answer: &str,
    ) -> Result<Response> {
        let id = crypto::notification_id(
            NotificationKind::ContactVerification.as_str(),
            &activity::verification_key(public_key),
        );
        let mut notification = self
            .store
            .notification(&id)?
            .ok_or_else(|| Error::NotFound(format!("verification request from {}", public_key)))?;

        let resolution = if accepted {
            Resolution::Accepted
        } else {
            Resolution::Dismissed
        };
        let (clock, _) =
            clock::next_clock_and_timestamp(notification.updated_at, &*self.clock);
        if !activity::resolve(&mut notification, resolution, clock).is_applied() {
            return Ok(Response::new());
        }
        let response = self.commit(ChangeSet {
            notifications: vec![notification],
            ..Default::default()
        })?;

        self.publish(
            &protocol::contact_topic(public_key),
            &Event::ContactVerificationResponse(ContactVerificationResponse {
                clock,
                accepted,
                response: answer.to_string(),
            }),
        )
        .await?;
        self.publish_sync(&Event::SyncActivityCenterUpdate(SyncActivityCenterUpdate {
            ids: vec![id],
            clock,
            read: None,
            resolution: Some(resolution),
        }))
        .await?;
        Ok(response)
    }

    // ---------------------------------------------------------------------
    // Communities
    // ---------------------------------------------------------------------

    /// Ask the control node of a registered community to let us in
    pub async fn request_to_join_community(&self, community_id: &str) -> Result<Response> {
        let community = self
            .community(community_id)?
            .ok_or_else(|| Error::NotFound(format!("community {}", community_id)))?;
        let event = Event::CommunityRequestToJoin(CommunityRequestToJoin {
            community_id: community_id.to_string(),
            clock: self.clock.now_ms(),
        });
        self.publish(&protocol::contact_topic(&community.control_node), &event)
            .await?;
        Ok(Response::new())
    }

    /// Distribute community keys for resolved key actions
    ///
    /// Only the control node may distribute. The first failed send aborts the
    /// remaining groups; the report lists what was sent before.
    pub async fn distribute_community_keys(
        &self,
        community_id: &str,
        actions: &EncryptionKeyActions,
    ) -> Result<DistributionReport> {
        let community = self
            .community(community_id)?
            .ok_or_else(|| Error::NotFound(format!("community {}", community_id)))?;
        let publisher = KeyExchangePublisher { messenger: self };
        keys::distribute(
            &self.me,
            &community,
            actions,
            &*self.ratchet,
            &publisher,
            self.clock.now_ms(),
        )
        .await
    }

    /// Rotate every community group key older than the rekey interval
    pub async fn rekey_due_groups(&self, community_id: &str) -> Result<DistributionReport> {
        let community = self
            .community(community_id)?
            .ok_or_else(|| Error::NotFound(format!("community {}", community_id)))?;
        let actions = keys::rekey_due(
            &community,
            &*self.ratchet,
            self.clock.now_ms(),
            self.settings.rekey_interval_ms,
        )?;
        self.distribute_community_keys(community_id, &actions).await
    }

    // ---------------------------------------------------------------------
    // Activity center
    // ---------------------------------------------------------------------

    /// Mark every unread notification as read
    pub async fn mark_all_notifications_read(&self) -> Result<Response> {
        let guard = self.store.locks().lock(ACTIVITY_CENTER_KEY).await?;
        let unread: Vec<Notification> = self
            .store
            .notifications()?
            .into_iter()
            .filter(Notification::is_unread)
            .collect();
        if unread.is_empty() {
            return Ok(Response::new());
        }

        let latest = unread.iter().map(|n| n.updated_at).max().unwrap_or_default();
        let (clock, _) = clock::next_clock_and_timestamp(latest, &*self.clock);

        let mut changes = ChangeSet::default();
        for mut notification in unread {
            if activity::mark_read(&mut notification, clock).is_applied() {
                changes.notifications.push(notification);
            }
        }
        let ids = changes.notifications.iter().map(|n| n.id.clone()).collect();
        let response = self.commit(changes)?;
        drop(guard);

        self.publish_sync(&Event::SyncActivityCenterUpdate(SyncActivityCenterUpdate {
            ids,
            clock,
            read: Some(true),
            resolution: None,
        }))
        .await?;
        Ok(response)
    }

    /// Record that the activity center was opened
    pub async fn mark_notifications_seen(&self) -> Result<Response> {
        let guard = self.store.locks().lock(ACTIVITY_CENTER_KEY).await?;
        let mut state = self.store.activity_state()?;
        if state.has_seen {
            return Ok(Response::new());
        }
        let (clock, _) = clock::next_clock_and_timestamp(state.updated_at, &*self.clock);
        state.merge(true, clock);
        let response = self.commit(ChangeSet {
            activity_state: Some(state),
            ..Default::default()
        })?;
        drop(guard);

        self.publish_sync(&Event::SyncActivityCenterState(SyncActivityCenterState {
            has_seen: true,
            updated_at: clock,
        }))
        .await?;
        Ok(response)
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    /// Handle one raw envelope from the transport
    ///
    /// # Errors
    /// * `Error::Validation` - malformed envelope, bad signature or bad IDs
    /// * `Error::Authority` - the sender may not make the change it carries
    pub async fn handle_payload(&self, payload: &[u8]) -> Result<Response> {
        let envelope = Envelope::from_cbor(payload)?;
        self.handle_envelope(envelope).await
    }

    /// Catch up on store-and-forward history from the last cursor
    ///
    /// Pages of `history_page_size` envelopes are requested until the
    /// transport has nothing more. Envelopes that fail validation or
    /// authority checks are logged and skipped; the cursor advances past
    /// them.
    pub async fn fetch_history(&self) -> Result<Response> {
        let mut cursor = self.history_cursor.lock().await;
        let mut response = Response::new();
        let mut fetched = 0usize;

        loop {
            let page = self
                .transport
                .fetch_history(cursor.clone(), self.settings.history_page_size)
                .await?;
            for payload in &page.envelopes {
                fetched += 1;
                match self.handle_payload(payload).await {
                    Ok(handled) => response.merge(handled),
                    Err(e) => tracing::warn!("Skipping stored envelope: {}", e),
                }
            }
            match page.next_cursor {
                Some(next) => *cursor = Some(next),
                None => break,
            }
        }

        tracing::info!("Caught up on {} stored envelopes", fetched);
        Ok(response)
    }

    async fn handle_envelope(&self, envelope: Envelope) -> Result<Response> {
        let mut response = Response::new();
        let mut queue = VecDeque::from([(envelope, false)]);

        while let Some((envelope, replayed)) = queue.pop_front() {
            let decoded = match envelope.open(&*self.ratchet) {
                Ok(Opened::Event(decoded)) => decoded,
                Ok(Opened::MissingKey { group_id, key_id }) => {
                    tracing::debug!(
                        "Holding payload for group {} until key {} arrives",
                        group_id,
                        key_id,
                    );
                    let mut held = self.held.lock().await;
                    let waiting = held.entry(group_id).or_default();
                    if !waiting.contains(&envelope) {
                        waiting.push(envelope);
                    }
                    continue;
                }
                Err(e) if replayed => {
                    tracing::warn!("Dropping held payload: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let installed_group = match &decoded.event {
                Event::KeyExchange(exchange) => Some(exchange.group_id.clone()),
                _ => None,
            };

            match self.dispatch(decoded).await {
                Ok(handled) => response.merge(handled),
                Err(e) if replayed => tracing::warn!("Dropping held payload: {}", e),
                Err(e) => return Err(e),
            }

            if let Some(group_id) = installed_group {
                let released = self.held.lock().await.remove(&group_id).unwrap_or_default();
                if !released.is_empty() {
                    tracing::info!(
                        "Replaying {} held payloads for group {}",
                        released.len(),
                        group_id,
                    );
                }
                queue.extend(released.into_iter().map(|envelope| (envelope, true)));
            }
        }

        Ok(response)
    }

    fn require_own_device(&self, sender: &str, kind: &str) -> Result<()> {
        if sender != self.me {
            return Err(Error::Authority(format!(
                "{} sent {} on behalf of {}",
                sender, kind, self.me
            )));
        }
        Ok(())
    }

    /// Local chat ID of an event: one-to-one events name the recipient
    fn local_chat_id(&self, sender: &str, chat_id: &str) -> String {
        if chat_id == self.me && sender != self.me {
            sender.to_string()
        } else {
            chat_id.to_string()
        }
    }

    async fn dispatch(&self, decoded: Decoded) -> Result<Response> {
        let Decoded {
            event,
            sender,
            message_id,
        } = decoded;

        if sender != self.me && self.store.contact(&sender)?.is_some_and(|c| c.blocked) {
            tracing::debug!("Dropping {} from blocked contact {}", event.kind(), sender);
            return Ok(Response::new());
        }
        let kind = event.kind();
        tracing::debug!("Handling {} from {}", kind, sender);

        match event {
            Event::ChatMessage(message) => {
                self.handle_chat_message(&sender, message_id, message).await
            }
            Event::EditMessage(edit) => {
                let chat_id = self.local_chat_id(&sender, &edit.chat_id);
                let mutated = self
                    .mutate_message(
                        &sender,
                        &chat_id,
                        &edit.message_id,
                        Some(edit.clock),
                        &Mutation::Edit(edit.text),
                    )
                    .await?;
                Ok(mutated.response)
            }
            Event::DeleteMessage(delete) => {
                let chat_id = self.local_chat_id(&sender, &delete.chat_id);
                let mutated = self
                    .mutate_message(
                        &sender,
                        &chat_id,
                        &delete.message_id,
                        Some(delete.clock),
                        &Mutation::Delete,
                    )
                    .await?;
                Ok(mutated.response)
            }
            Event::DeleteForMe(delete) => {
                let mutated = self
                    .mutate_message(
                        &sender,
                        &delete.chat_id,
                        &delete.message_id,
                        Some(delete.clock),
                        &Mutation::DeleteForMe,
                    )
                    .await?;
                Ok(mutated.response)
            }
            Event::PinMessage(pin) => {
                let chat_id = self.local_chat_id(&sender, &pin.chat_id);
                let mutated = self
                    .mutate_message(
                        &sender,
                        &chat_id,
                        &pin.message_id,
                        Some(pin.clock),
                        &Mutation::Pin(pin.pinned),
                    )
                    .await?;
                Ok(mutated.response)
            }
            Event::MembershipUpdate(update) => self.handle_membership_update(update).await,
            Event::ContactUpdate(update) => {
                if sender == self.me {
                    return Ok(Response::new());
                }
                let (response, contact) = self
                    .merge_contact_state(&sender, &update.state, Some(&update.display_name))
                    .await?;
                if let Some(contact) = contact {
                    self.send_contact_update(&contact).await?;
                }
                Ok(response)
            }
            Event::SyncContact(sync) => {
                self.require_own_device(&sender, kind)?;
                self.handle_sync_contact(sync).await
            }
            Event::SyncClearHistory(clear) => {
                self.require_own_device(&sender, kind)?;
                self.handle_clear_history(clear).await
            }
            Event::KeyExchange(exchange) => self.handle_key_exchange(&sender, exchange),
            Event::CommunityRequestToJoin(request) => self.handle_request_to_join(&sender, request),
            Event::ContactVerificationRequest(request) => {
                match self.store.contact(&sender)? {
                    Some(contact) if contact.mutual() => {}
                    _ => {
                        tracing::debug!(
                            "Ignoring verification request from non-contact {}",
                            sender,
                        );
                        return Ok(Response::new());
                    }
                }
                let mut changes = ChangeSet::default();
                let notification =
                    activity::for_verification_request(&sender, request.clock, self.clock.now_ms());
                self.stage_notification(&mut changes, notification)?;
                self.commit(changes)
            }
            Event::ContactVerificationResponse(answer) => {
                let mut notification =
                    activity::for_verification_request(&sender, answer.clock, self.clock.now_ms());
                notification.resolution = if answer.accepted {
                    Resolution::Accepted
                } else {
                    Resolution::Dismissed
                };
                let mut changes = ChangeSet::default();
                self.stage_notification(&mut changes, notification)?;
                self.commit(changes)
            }
            Event::SyncActivityCenterUpdate(update) => {
                self.require_own_device(&sender, kind)?;
                let mut changes = ChangeSet::default();
                for id in &update.ids {
                    if let Some(mut notification) = self.store.notification(id)? {
                        if notification
                            .apply_state(update.read, update.resolution, update.clock)
                            .is_applied()
                        {
                            changes.notifications.push(notification);
                        }
                    }
                }
                self.commit(changes)
            }
            Event::SyncActivityCenterState(sync) => {
                self.require_own_device(&sender, kind)?;
                let _guard = self.store.locks().lock(ACTIVITY_CENTER_KEY).await?;
                let mut state = self.store.activity_state()?;
                if !state.merge(sync.has_seen, sync.updated_at).is_applied() {
                    return Ok(Response::new());
                }
                self.commit(ChangeSet {
                    activity_state: Some(state),
                    ..Default::default()
                })
            }
        }
    }

    async fn handle_chat_message(
        &self,
        sender: &str,
        message_id: String,
        incoming: ChatMessage,
    ) -> Result<Response> {
        if incoming.chat_type == ChatType::OneToOne
            && sender != self.me
            && incoming.chat_id != self.me
        {
            tracing::debug!(
                "Ignoring one-to-one message {} addressed to {}",
                message_id,
                incoming.chat_id,
            );
            return Ok(Response::new());
        }
        let chat_id = match incoming.chat_type {
            ChatType::OneToOne => self.local_chat_id(sender, &incoming.chat_id),
            _ => incoming.chat_id.clone(),
        };
        chat::validate_id(&chat_id, incoming.chat_type)?;

        let mut response = Response::new();
        if incoming.chat_type == ChatType::OneToOne && sender != self.me {
            if let Some(state) = &incoming.contact_state {
                let (merged, send_back) = self.merge_contact_state(sender, state, None).await?;
                response.merge(merged);
                if let Some(contact) = send_back {
                    self.send_contact_update(&contact).await?;
                }
            }
        }

        let _guards = self
            .store
            .locks()
            .lock_all(&[chat_key(&chat_id), message_key(&message_id)])
            .await?;

        let mut chat = match self.store.chat(&chat_id)? {
            Some(chat) => chat,
            None => match incoming.chat_type {
                ChatType::OneToOne => {
                    let mut chat = Chat::one_to_one(&chat_id, &*self.clock)?;
                    chat.active = false;
                    chat
                }
                ChatType::PrivateGroup => Chat::from_group_id(&chat_id, &*self.clock)?,
                _ => {
                    tracing::debug!(
                        "Ignoring message {} for unjoined chat {}",
                        message_id,
                        chat_id,
                    );
                    return Ok(response);
                }
            },
        };
        if chat.chat_type != incoming.chat_type {
            return Err(Error::Validation(format!(
                "message {} claims {:?} for {:?} chat {}",
                message_id, incoming.chat_type, chat.chat_type, chat_id
            )));
        }
        let withheld = chat.chat_type == ChatType::PrivateGroup
            && !chat.was_member_at(sender, incoming.clock)?;
        if withheld {
            tracing::debug!(
                "Withholding message {}: {} was not a member of {} at {}",
                message_id,
                sender,
                chat_id,
                incoming.clock
            );
        }

        let mentions_me = sender != self.me && Message::text_mentions(&incoming.text, &self.me);
        let activate = match chat.chat_type {
            ChatType::OneToOne => {
                sender == self.me
                    || self.store.contact(&chat_id)?.is_some_and(|contact| contact.mutual())
            }
            ChatType::PrivateGroup => chat.is_joined_member(&self.me),
            _ => mentions_me,
        };

        let mut message = Message::new(
            message_id.clone(),
            chat_id.clone(),
            sender.to_string(),
            incoming.text,
            incoming.clock,
            incoming.timestamp,
        )
        .with_response_to(incoming.response_to);
        message.withheld = withheld;

        let mut state = MessageState::new(
            self.store.message(&message_id)?,
            self.store.mutations(&message_id, &chat_id)?,
        );
        let had_mutations = !state.mutations.is_empty();
        if !mutation::ingest(&mut state, message, &mut chat, &self.me, activate).is_applied() {
            return Ok(response);
        }

        let mut changes = ChangeSet::default();
        if let Some(message) = &state.message {
            if message.is_visible() {
                self.stage_message_notifications(&mut changes, message)?;
            }
            changes.messages.push(message.clone());
        }
        if had_mutations || !state.mutations.is_empty() {
            changes.mutations.push(state.mutations);
        }
        changes.chats.push(chat);

        tracing::info!("Received message {} in {}", message_id, chat_id);
        response.merge(self.commit(changes)?);
        Ok(response)
    }

    async fn handle_membership_update(&self, update: MembershipUpdate) -> Result<Response> {
        chat::validate_id(&update.chat_id, ChatType::PrivateGroup)?;
        for event in &update.events {
            event.verify(&update.chat_id)?;
        }

        let _guard = self.store.locks().lock(&chat_key(&update.chat_id)).await?;
        let (mut chat, known) = match self.store.chat(&update.chat_id)? {
            Some(chat) => (chat, true),
            None => (Chat::from_group_id(&update.chat_id, &*self.clock)?, false),
        };

        let change = chat.apply_membership_events(&update.events, &self.me)?;
        if !change.outcome.is_applied() {
            return Ok(Response::new());
        }
        if !known && !chat.members.contains_key(&self.me) {
            tracing::debug!("Ignoring membership of group {} we are not part of", update.chat_id);
            return Ok(Response::new());
        }
        if change.joined {
            tracing::info!("Joined group {}", chat.id);
        }
        if change.left {
            tracing::info!("Left group {}", chat.id);
        }

        let mut changes = ChangeSet::default();
        self.stage_membership_gate(&mut chat, &mut changes)?;
        changes.chats.push(chat);
        self.commit(changes)
    }

    /// Re-check the stored messages of a group against its membership log
    ///
    /// A message is shown iff its sender was a member at the message clock,
    /// so messages that arrived before the log, or before a late membership
    /// event, end up the same as if everything had arrived in order. The
    /// caller holds the chat lock.
    fn stage_membership_gate(&self, chat: &mut Chat, changes: &mut ChangeSet) -> Result<()> {
        let mut messages = self.store.messages_for_chat(&chat.id)?;
        let mut refresh = false;

        for message in messages.iter_mut() {
            if message.clock <= chat.deleted_at_clock_value {
                continue;
            }
            let withheld = !chat.was_member_at(&message.from, message.clock)?;
            let effect = mutation::apply_membership_gate(message, chat, withheld, &self.me);
            if !effect.outcome.is_applied() {
                continue;
            }
            refresh |= effect.last_message_cleared;
            if effect.hidden {
                tracing::debug!("Withholding message {} from {}", message.id, message.from);
                self.stage_hidden_notifications(
                    changes,
                    &message.id,
                    &[NotificationKind::Mention, NotificationKind::Reply],
                    clock::next_clock_and_timestamp(chat.last_clock_value, &*self.clock).0,
                )?;
            }
            if effect.resurfaced {
                self.stage_message_notifications(changes, message)?;
            }
            changes.messages.push(message.clone());
        }

        if refresh {
            let latest = messages
                .iter()
                .filter(|m| m.is_visible())
                .max_by(|a, b| clock::compare(a.clock, &a.id, b.clock, &b.id))
                .cloned();
            chat.refresh_last_message(latest);
        }
        Ok(())
    }

    /// Merge a peer's propagated contact state
    ///
    /// # Returns
    /// The response, and the contact to send our state back to when the peer
    /// is behind
    async fn merge_contact_state(
        &self,
        sender: &str,
        state: &PropagatedState,
        display_name: Option<&str>,
    ) -> Result<(Response, Option<Contact>)> {
        let _guards = self
            .store
            .locks()
            .lock_all(&[contact_key(sender), chat_key(sender)])
            .await?;

        let mut contact = match self.store.contact(sender)? {
            Some(contact) => contact,
            None => Contact::new(sender)?,
        };

        let renamed = match display_name {
            Some(name) if !name.is_empty() && contact.display_name != name => {
                contact.display_name = name.to_string();
                true
            }
            _ => false,
        };
        let result = contacts::merge_propagated_state(&mut contact, state);

        let mut changes = ChangeSet::default();
        if result.outcome.is_applied() || renamed {
            changes.contacts.push(contact.clone());
        }
        if let Some(notification) = activity::for_contact(&contact, &result, self.clock.now_ms()) {
            self.stage_notification(&mut changes, notification)?;
        }
        if result.became_mutual {
            let request_id =
                crypto::notification_id(NotificationKind::ContactRequest.as_str(), sender);
            if let Some(mut request) = self.store.notification(&request_id)? {
                if activity::resolve(&mut request, Resolution::Accepted, contact.last_updated)
                    .is_applied()
                {
                    changes.notifications.push(request);
                }
            }
        }
        if result.new_request_received || result.became_mutual {
            let chat = match self.store.chat(sender)? {
                Some(mut chat) => {
                    chat.active |= result.became_mutual;
                    chat
                }
                None => {
                    let mut chat = Chat::one_to_one(sender, &*self.clock)?;
                    chat.active = result.became_mutual;
                    chat
                }
            };
            changes.chats.push(chat);
        }

        if result.new_request_received {
            tracing::info!("Contact request received from {}", sender);
        }
        if result.removed_by_peer {
            tracing::info!("Contact {} removed us", sender);
        }

        let response = self.commit(changes)?;
        let send_back = result.send_back_state.then_some(contact);
        Ok((response, send_back))
    }

    async fn handle_sync_contact(&self, sync: SyncContact) -> Result<Response> {
        crypto::validate_public_key(&sync.contact_id)?;
        let _guards = self
            .store
            .locks()
            .lock_all(&[contact_key(&sync.contact_id), chat_key(&sync.contact_id)])
            .await?;

        let mut contact = match self.store.contact(&sync.contact_id)? {
            Some(contact) => contact,
            None => Contact::new(&sync.contact_id)?,
        };

        let mut outcome = contacts::merge_paired_state(&mut contact, &sync.state).outcome;
        outcome = outcome.or(contacts::set_blocked(&mut contact, sync.blocked, sync.blocked_clock));
        if let Some((name, clock)) = &sync.ens_name {
            outcome = outcome.or(contacts::set_ens_name(&mut contact, name, *clock));
        }
        if !outcome.is_applied() {
            return Ok(Response::new());
        }

        let mut changes = ChangeSet {
            contacts: vec![contact.clone()],
            ..Default::default()
        };
        if contact.added() && self.store.chat(&contact.id)?.is_none() {
            changes.chats.push(Chat::one_to_one(&contact.id, &*self.clock)?);
        }
        self.commit(changes)
    }

    async fn handle_clear_history(&self, clear: SyncClearHistory) -> Result<Response> {
        let _guard = self.store.locks().lock(&chat_key(&clear.chat_id)).await?;
        let Some(mut chat) = self.store.chat(&clear.chat_id)? else {
            tracing::debug!("Ignoring history clear of unknown chat {}", clear.chat_id);
            return Ok(Response::new());
        };
        if !chat.apply_deleted_at(clear.clock).is_applied() {
            return Ok(Response::new());
        }
        self.commit(ChangeSet {
            chats: vec![chat],
            ..Default::default()
        })
    }

    fn handle_key_exchange(&self, sender: &str, exchange: KeyExchange) -> Result<Response> {
        if sender == self.me || !exchange.recipients.iter().any(|r| r == &self.me) {
            return Ok(Response::new());
        }
        let community = self
            .community(&exchange.community_id)?
            .ok_or_else(|| Error::NotFound(format!("community {}", exchange.community_id)))?;
        let (key, outcome) = keys::receive(&exchange, sender, &community, &*self.ratchet)?;
        if outcome.is_applied() {
            tracing::info!("Received key {} for group {}", key.key_id, key.group_id);
        }
        Ok(Response::new())
    }

    fn handle_request_to_join(
        &self,
        sender: &str,
        request: CommunityRequestToJoin,
    ) -> Result<Response> {
        let Some(community) = self.community(&request.community_id)? else {
            return Ok(Response::new());
        };
        if !community.is_control_node(&self.me) {
            return Ok(Response::new());
        }
        let mut changes = ChangeSet::default();
        self.stage_notification(
            &mut changes,
            activity::for_request_to_join(
                &community.id,
                sender,
                request.clock,
                self.clock.now_ms(),
            ),
        )?;
        self.commit(changes)
    }
}

/// Sends key exchanges through a messenger's transport
struct KeyExchangePublisher<'a, T: Transport> {
    messenger: &'a Messenger<T>,
}

impl<T: Transport> KeyExchangeSender for KeyExchangePublisher<'_, T> {
    async fn send_key_exchange(&self, exchange: &KeyExchange) -> Result<()> {
        self.messenger
            .publish(
                &protocol::key_exchange_topic(&exchange.group_id),
                &Event::KeyExchange(exchange.clone()),
            )
            .await?;
        Ok(())
    }
}
