//! Message mutation engine
//!
//! Edits, deletes, delete-for-me, pins and seen/unread changes are each a
//! small clock-gated state machine stored in [`MessageMutations`], keyed by
//! message ID and independent of whether the message has arrived. The visible
//! message is always a projection of the message as received plus its
//! mutation state, so the arrival order of a message and its mutations never
//! changes the result.

use crate::clock::{self, MergeOutcome};
use crate::storage::{Chat, ChatType, Message, MessageMutations};
use crate::{Error, Result};
use tracing::{debug, warn};

/// A message together with its mutation state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageState {
    /// The message, once it has arrived
    pub message: Option<Message>,
    /// Mutations recorded for it so far
    pub mutations: MessageMutations,
}

impl MessageState {
    /// State of a message with no mutations yet
    pub fn new(message: Option<Message>, mutations: MessageMutations) -> Self {
        Self { message, mutations }
    }
}

/// What applying a mutation changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationEffect {
    /// Whether the mutation state changed
    pub outcome: MergeOutcome,
    /// The message went from visible to hidden
    pub hidden: bool,
    /// The message went from hidden to visible
    pub resurfaced: bool,
    /// The message now mentions the local user and did not before
    pub mention_added: bool,
    /// The message no longer mentions the local user
    pub mention_removed: bool,
    /// The chat's last message was hidden and must be re-derived
    pub last_message_cleared: bool,
}

impl MutationEffect {
    fn stale() -> Self {
        Self {
            outcome: MergeOutcome::Stale,
            hidden: false,
            resurfaced: false,
            mention_added: false,
            mention_removed: false,
            last_message_cleared: false,
        }
    }
}

/// Whether `author` may delete `message` for everyone in `chat`
fn may_delete(author: &str, message: &Message, chat: Option<&Chat>) -> bool {
    author == message.from
        || chat.is_some_and(|chat| {
            chat.chat_type == ChatType::PrivateGroup && chat.is_admin(author)
        })
}

/// Recompute the mutable fields of `message` from its mutation state
///
/// * Edits by the author newer than the message replace its text; the
///   received text is kept as `original_text`.
/// * A delete tombstone at or above the message clock hides it, unless an edit
///   strictly newer than the tombstone re-surfaced it.
/// * Pins only ever change the pin flag.
pub fn project(message: &mut Message, mutations: &MessageMutations, me: &str) {
    let base_text = message.original_text.clone().unwrap_or_else(|| message.text.clone());

    let edit = mutations
        .edit
        .as_ref()
        .filter(|edit| edit.author == message.from && clock::newer(edit.clock, message.clock));
    match edit {
        Some(edit) => {
            message.text = edit.value.clone();
            message.edited_at = edit.clock;
            message.original_text = Some(base_text);
        }
        None => {
            message.text = base_text;
            message.edited_at = 0;
            message.original_text = None;
        }
    }

    match &mutations.delete {
        Some(delete)
            if delete.clock >= message.clock
                && !edit.is_some_and(|e| clock::newer(e.clock, delete.clock)) =>
        {
            message.deleted = true;
            message.deleted_by = Some(delete.author.clone());
        }
        _ => {
            message.deleted = false;
            message.deleted_by = None;
        }
    }

    message.deleted_for_me = mutations.delete_for_me.as_ref().is_some_and(|d| d.value);

    match &mutations.pin {
        Some(pin) if pin.value => {
            message.pinned = true;
            message.pinned_by = Some(pin.author.clone());
        }
        _ => {
            message.pinned = false;
            message.pinned_by = None;
        }
    }

    message.mentioned = message.from != me && Message::text_mentions(&message.text, me);
}

/// Re-project a known message and propagate the change to its chat
fn reproject(
    state: &mut MessageState,
    chat: Option<&mut Chat>,
    me: &str,
    outcome: MergeOutcome,
) -> MutationEffect {
    let Some(message) = state.message.as_mut() else {
        return MutationEffect {
            outcome,
            ..MutationEffect::stale()
        };
    };

    let was_visible = message.is_visible();
    let was_mentioned = message.mentioned;
    let before = message.unread_weight(me);

    project(message, &state.mutations, me);

    let after = message.unread_weight(me);
    let mut last_message_cleared = false;
    if let Some(chat) = chat {
        chat.adjust_unread(before, after);
        last_message_cleared = chat.offer_last_message(message);
    }

    MutationEffect {
        outcome,
        hidden: was_visible && !message.is_visible(),
        resurfaced: !was_visible && message.is_visible(),
        mention_added: !was_mentioned && message.mentioned,
        mention_removed: was_mentioned && !message.mentioned,
        last_message_cleared,
    }
}

/// Fold the deletes and edits held per author into the message's registers
///
/// Only authors allowed to make them count; the rest are dropped.
fn resolve_pending(mutations: &mut MessageMutations, message: &Message, chat: &Chat) {
    for (author, delete) in std::mem::take(&mut mutations.pending_deletes) {
        if may_delete(&author, message, Some(chat)) {
            clock::merge_optional(&mut mutations.delete, delete.value, delete.clock, &author);
        } else {
            warn!("Dropping delete of {} by a non-author", message.id);
        }
    }
    for (author, edit) in std::mem::take(&mut mutations.pending_edits) {
        if author == message.from {
            clock::merge_optional(&mut mutations.edit, edit.value, edit.clock, &author);
        } else {
            warn!("Dropping edit of {} by a non-author", message.id);
        }
    }
}

/// Accept a message into its chat, applying any mutation that arrived first
///
/// Mutations recorded before the message whose author turns out not to be
/// allowed to make them are dropped here.
///
/// # Returns
/// `Stale` if the message was already known or is below the chat's deletion
/// fence; in the latter case nothing is stored.
pub fn ingest(
    state: &mut MessageState,
    mut message: Message,
    chat: &mut Chat,
    me: &str,
    activate: bool,
) -> MergeOutcome {
    if state.message.is_some() {
        debug!("Message {} already known", message.id);
        return MergeOutcome::Stale;
    }

    resolve_pending(&mut state.mutations, &message, chat);

    message.seen = message.from == me;
    project(&mut message, &state.mutations, me);

    let activate = activate && message.is_visible();
    if chat.apply_inbound_message(&message, activate) == MergeOutcome::Stale {
        debug!(
            "Message {} at clock {} is below the deletion fence of {}",
            message.id, message.clock, chat.id
        );
        return MergeOutcome::Stale;
    }

    chat.adjust_unread((0, 0), message.unread_weight(me));
    state.message = Some(message);
    MergeOutcome::Applied
}

/// Apply a delete-for-everyone
///
/// The tombstone is recorded even if the message has not arrived yet, held
/// under its author until the message shows whether they may delete it.
///
/// # Errors
/// `Error::Authority` if the message is known and `author` is neither its
/// sender nor an admin of its group
pub fn apply_delete(
    state: &mut MessageState,
    chat: Option<&mut Chat>,
    author: &str,
    clock: u64,
    me: &str,
) -> Result<MutationEffect> {
    let outcome = match &state.message {
        Some(message) => {
            if !may_delete(author, message, chat.as_deref()) {
                return Err(Error::Authority(format!(
                    "{} may not delete message {}",
                    author, message.id
                )));
            }
            clock::merge_optional(&mut state.mutations.delete, true, clock, author)
        }
        None => clock::merge_keyed(&mut state.mutations.pending_deletes, true, clock, author),
    };
    if !outcome.is_applied() {
        return Ok(MutationEffect::stale());
    }
    Ok(reproject(state, chat, me, outcome))
}

/// Apply a delete-for-me coming from one of the local identity's devices
///
/// # Errors
/// `Error::Authority` if `author` is not the local identity
pub fn apply_delete_for_me(
    state: &mut MessageState,
    chat: Option<&mut Chat>,
    author: &str,
    clock: u64,
    me: &str,
) -> Result<MutationEffect> {
    if author != me {
        return Err(Error::Authority(format!("{} may not hide messages for {}", author, me)));
    }

    let outcome = clock::merge_optional(&mut state.mutations.delete_for_me, true, clock, author);
    if !outcome.is_applied() {
        return Ok(MutationEffect::stale());
    }
    Ok(reproject(state, chat, me, outcome))
}

/// Apply an edit
///
/// An edit is taken iff its clock is newer than both the message and the
/// last accepted edit; anything else is a stale no-op.
///
/// # Errors
/// `Error::Authority` if the message is known and `author` did not send it
pub fn apply_edit(
    state: &mut MessageState,
    chat: Option<&mut Chat>,
    author: &str,
    text: &str,
    clock: u64,
    me: &str,
) -> Result<MutationEffect> {
    let outcome = match &state.message {
        Some(message) => {
            if author != message.from {
                return Err(Error::Authority(format!(
                    "{} may not edit message {}",
                    author, message.id
                )));
            }
            if !clock::newer(clock, message.clock) {
                debug!("Edit of {} at clock {} predates the message", message.id, clock);
                return Ok(MutationEffect::stale());
            }
            clock::merge_optional(&mut state.mutations.edit, text.to_string(), clock, author)
        }
        None => clock::merge_keyed(
            &mut state.mutations.pending_edits,
            text.to_string(),
            clock,
            author,
        ),
    };
    if !outcome.is_applied() {
        return Ok(MutationEffect::stale());
    }
    Ok(reproject(state, chat, me, outcome))
}

/// Apply a pin or unpin
pub fn apply_pin(
    state: &mut MessageState,
    chat: Option<&mut Chat>,
    author: &str,
    pinned: bool,
    clock: u64,
    me: &str,
) -> MutationEffect {
    let outcome = clock::merge_optional(&mut state.mutations.pin, pinned, clock, author);
    if !outcome.is_applied() {
        return MutationEffect::stale();
    }
    reproject(state, chat, me, outcome)
}

/// Withhold or release a group message after its sender's membership at the
/// message clock was re-evaluated
pub fn apply_membership_gate(
    message: &mut Message,
    chat: &mut Chat,
    withheld: bool,
    me: &str,
) -> MutationEffect {
    if message.withheld == withheld {
        return MutationEffect::stale();
    }

    let was_visible = message.is_visible();
    let before = message.unread_weight(me);
    message.withheld = withheld;
    chat.adjust_unread(before, message.unread_weight(me));
    let last_message_cleared = chat.offer_last_message(message);

    MutationEffect {
        outcome: MergeOutcome::Applied,
        hidden: was_visible && !message.is_visible(),
        resurfaced: !was_visible && message.is_visible(),
        last_message_cleared,
        ..MutationEffect::stale()
    }
}

/// Mark a message as seen
pub fn mark_seen(message: &mut Message, chat: &mut Chat, me: &str) -> MergeOutcome {
    if message.seen {
        return MergeOutcome::Stale;
    }
    let before = message.unread_weight(me);
    message.seen = true;
    chat.adjust_unread(before, message.unread_weight(me));
    MergeOutcome::Applied
}

/// Mark a message as unread again
///
/// Purely local. Counters are moved by the message's weight and clamp at
/// zero, so a chat whose counters were reset externally stays consistent.
pub fn mark_unread(message: &mut Message, chat: &mut Chat, me: &str) -> MergeOutcome {
    if !message.seen {
        return MergeOutcome::Stale;
    }
    let before = message.unread_weight(me);
    message.seen = false;
    chat.adjust_unread(before, message.unread_weight(me));
    MergeOutcome::Applied
}
