// Mutation Tests - Testing edits, deletes, pins and unread accounting
use crate::clock::{ManualClock, MergeOutcome};
use crate::mutation::*;
use crate::storage::{Chat, Message, MessageMutations};
use crate::Error;

const ME: &str = "me";
const ALICE: &str = "alice";
const BOB: &str = "bob";
const CHAT: &str = "status";

fn chat() -> Chat {
    Chat::public(CHAT, &ManualClock::new(1)).expect("Failed to create chat")
}

fn message(id: &str, from: &str, text: &str, clock: u64) -> Message {
    Message::new(
        id.to_string(),
        CHAT.to_string(),
        from.to_string(),
        text.to_string(),
        clock,
        clock,
    )
}

fn empty_state(id: &str) -> MessageState {
    MessageState::new(None, MessageMutations::new(id, CHAT))
}

fn received(id: &str, from: &str, text: &str, clock: u64) -> (MessageState, Chat) {
    let mut state = empty_state(id);
    let mut chat = chat();
    assert_eq!(
        ingest(&mut state, message(id, from, text, clock), &mut chat, ME, true),
        MergeOutcome::Applied
    );
    (state, chat)
}

fn stored(state: &MessageState) -> &Message {
    state.message.as_ref().expect("message should be stored")
}

#[test]
fn test_ingest_counts_unread_and_mentions() {
    let (state, chat) = received("m1", ALICE, "hi @me", 10);
    assert!(stored(&state).mentioned);
    assert!(!stored(&state).seen);
    assert_eq!(chat.unviewed_messages_count, 1);
    assert_eq!(chat.unviewed_mentions_count, 1);
    assert!(chat.active);
}

#[test]
fn test_ingest_own_message_is_seen() {
    let (state, chat) = received("m1", ME, "hello", 10);
    assert!(stored(&state).seen);
    assert_eq!(chat.unviewed_messages_count, 0);
}

#[test]
fn test_ingest_duplicate_is_stale() {
    let (mut state, mut chat) = received("m1", ALICE, "hello", 10);
    let again = ingest(&mut state, message("m1", ALICE, "hello", 10), &mut chat, ME, true);
    assert_eq!(again, MergeOutcome::Stale);
    assert_eq!(chat.unviewed_messages_count, 1);
}

#[test]
fn test_delete_before_message_hides_it() {
    let mut state = empty_state("m1");
    let mut chat = chat();

    let effect = apply_delete(&mut state, None, ALICE, 20, ME).expect("Failed to delete");
    assert_eq!(effect.outcome, MergeOutcome::Applied);
    assert!(state.mutations.pending_deletes.contains_key(ALICE));

    ingest(&mut state, message("m1", ALICE, "oops @me", 10), &mut chat, ME, true);
    let message = stored(&state);
    assert!(message.deleted);
    assert_eq!(message.deleted_by.as_deref(), Some(ALICE));
    assert_eq!(chat.unviewed_messages_count, 0);
    assert_eq!(chat.unviewed_mentions_count, 0);
    assert!(chat.last_message.is_none());
}

#[test]
fn test_delete_and_message_commute() {
    let (mut after, mut after_chat) = received("m1", ALICE, "hello", 10);
    let effect = apply_delete(&mut after, Some(&mut after_chat), ALICE, 20, ME)
        .expect("Failed to delete");
    assert!(effect.hidden);
    assert!(effect.last_message_cleared);

    let mut before = empty_state("m1");
    let mut before_chat = chat();
    apply_delete(&mut before, None, ALICE, 20, ME).expect("Failed to delete");
    ingest(&mut before, message("m1", ALICE, "hello", 10), &mut before_chat, ME, false);

    assert_eq!(after.message, before.message);
    assert_eq!(after.mutations, before.mutations);
    assert_eq!(after_chat.unviewed_messages_count, before_chat.unviewed_messages_count);
    assert_eq!(after_chat.last_message, before_chat.last_message);
}

#[test]
fn test_delete_is_idempotent() {
    let (mut state, mut chat) = received("m1", ALICE, "hello", 10);
    apply_delete(&mut state, Some(&mut chat), ALICE, 20, ME).expect("Failed to delete");
    let snapshot = (state.clone(), chat.clone());

    let again = apply_delete(&mut state, Some(&mut chat), ALICE, 20, ME).expect("Failed to delete");
    assert_eq!(again.outcome, MergeOutcome::Stale);
    assert_eq!((state, chat), snapshot);
}

#[test]
fn test_delete_by_non_author_rejected() {
    let (mut state, mut chat) = received("m1", ALICE, "hello", 10);
    let result = apply_delete(&mut state, Some(&mut chat), BOB, 20, ME);
    assert!(matches!(result, Err(Error::Authority(_))));
    assert!(state.mutations.delete.is_none());
    assert!(!stored(&state).deleted);
}

#[test]
fn test_early_delete_by_non_author_dropped_on_arrival() {
    let mut state = empty_state("m1");
    let mut chat = chat();
    apply_delete(&mut state, None, BOB, 20, ME).expect("Failed to record delete");

    ingest(&mut state, message("m1", ALICE, "hello", 10), &mut chat, ME, true);
    assert!(state.mutations.delete.is_none());
    assert!(state.mutations.pending_deletes.is_empty());
    assert!(!stored(&state).deleted);
    assert_eq!(chat.unviewed_messages_count, 1);
}

#[test]
fn test_newer_delete_by_non_author_does_not_mask_authors_delete() {
    let (mut message_first, mut first_chat) = received("m1", ALICE, "hello", 10);
    let forged = apply_delete(&mut message_first, Some(&mut first_chat), BOB, 200, ME);
    assert!(matches!(forged, Err(Error::Authority(_))));
    apply_delete(&mut message_first, Some(&mut first_chat), ALICE, 150, ME)
        .expect("Failed to delete");

    let mut message_last = empty_state("m1");
    let mut last_chat = chat();
    apply_delete(&mut message_last, None, BOB, 200, ME).expect("Failed to record delete");
    apply_delete(&mut message_last, None, ALICE, 150, ME).expect("Failed to record delete");
    ingest(&mut message_last, message("m1", ALICE, "hello", 10), &mut last_chat, ME, true);

    assert!(stored(&message_first).deleted);
    assert!(stored(&message_last).deleted);
    assert_eq!(stored(&message_last).deleted_by.as_deref(), Some(ALICE));
    assert_eq!(message_first.mutations, message_last.mutations);
    assert_eq!(first_chat.unviewed_messages_count, last_chat.unviewed_messages_count);
}

#[test]
fn test_newer_edit_by_non_author_does_not_mask_authors_edit() {
    let (mut message_first, mut first_chat) = received("m1", ALICE, "hello", 10);
    let forged = apply_edit(&mut message_first, Some(&mut first_chat), BOB, "forged", 200, ME);
    assert!(matches!(forged, Err(Error::Authority(_))));
    apply_edit(&mut message_first, Some(&mut first_chat), ALICE, "fixed", 150, ME)
        .expect("Failed to edit");

    let mut message_last = empty_state("m1");
    let mut last_chat = chat();
    apply_edit(&mut message_last, None, BOB, "forged", 200, ME).expect("Failed to record edit");
    apply_edit(&mut message_last, None, ALICE, "fixed", 150, ME).expect("Failed to record edit");
    ingest(&mut message_last, message("m1", ALICE, "hello", 10), &mut last_chat, ME, true);

    assert_eq!(stored(&message_first).text, "fixed");
    assert_eq!(stored(&message_last).text, "fixed");
    assert!(message_last.mutations.pending_edits.is_empty());
    assert_eq!(message_first.message, message_last.message);
}

#[test]
fn test_edit_replaces_text_and_keeps_original() {
    let (mut state, mut chat) = received("m1", ALICE, "helo", 10);
    let effect = apply_edit(&mut state, Some(&mut chat), ALICE, "hello", 11, ME)
        .expect("Failed to edit");
    assert_eq!(effect.outcome, MergeOutcome::Applied);

    let message = stored(&state);
    assert_eq!(message.text, "hello");
    assert_eq!(message.original_text.as_deref(), Some("helo"));
    assert_eq!(message.edited_at, 11);
    assert_eq!(chat.last_message.as_ref().map(|m| m.text.as_str()), Some("hello"));
}

#[test]
fn test_edit_older_than_message_is_stale() {
    let (mut state, mut chat) = received("m1", ALICE, "hello", 10);
    let effect = apply_edit(&mut state, Some(&mut chat), ALICE, "old", 10, ME)
        .expect("Failed to edit");
    assert_eq!(effect.outcome, MergeOutcome::Stale);
    assert_eq!(stored(&state).text, "hello");
}

#[test]
fn test_edits_converge_in_any_order() {
    let (mut forward, mut forward_chat) = received("m1", ALICE, "v0", 10);
    apply_edit(&mut forward, Some(&mut forward_chat), ALICE, "v1", 11, ME).expect("Failed to edit");
    apply_edit(&mut forward, Some(&mut forward_chat), ALICE, "v2", 12, ME).expect("Failed to edit");

    let (mut backward, mut backward_chat) = received("m1", ALICE, "v0", 10);
    apply_edit(&mut backward, Some(&mut backward_chat), ALICE, "v2", 12, ME)
        .expect("Failed to edit");
    let stale = apply_edit(&mut backward, Some(&mut backward_chat), ALICE, "v1", 11, ME)
        .expect("Failed to edit");
    assert_eq!(stale.outcome, MergeOutcome::Stale);

    assert_eq!(forward.message, backward.message);
    assert_eq!(stored(&forward).text, "v2");
}

#[test]
fn test_edit_by_non_author_rejected() {
    let (mut state, mut chat) = received("m1", ALICE, "hello", 10);
    let result = apply_edit(&mut state, Some(&mut chat), BOB, "hacked", 11, ME);
    assert!(matches!(result, Err(Error::Authority(_))));
    assert_eq!(stored(&state).text, "hello");
}

#[test]
fn test_edit_before_message_applies_on_arrival() {
    let mut state = empty_state("m1");
    let mut chat = chat();
    apply_edit(&mut state, None, ALICE, "fixed", 11, ME).expect("Failed to record edit");

    ingest(&mut state, message("m1", ALICE, "fixd", 10), &mut chat, ME, true);
    assert_eq!(stored(&state).text, "fixed");
    assert_eq!(stored(&state).original_text.as_deref(), Some("fixd"));
}

#[test]
fn test_edit_adding_mention_updates_counters() {
    let (mut state, mut chat) = received("m1", ALICE, "hello", 10);
    assert_eq!(chat.unviewed_mentions_count, 0);

    let effect = apply_edit(&mut state, Some(&mut chat), ALICE, "hello @me", 11, ME)
        .expect("Failed to edit");
    assert!(effect.mention_added);
    assert_eq!(chat.unviewed_mentions_count, 1);

    let effect = apply_edit(&mut state, Some(&mut chat), ALICE, "hello", 12, ME)
        .expect("Failed to edit");
    assert!(effect.mention_removed);
    assert_eq!(chat.unviewed_mentions_count, 0);
    assert_eq!(chat.unviewed_messages_count, 1);
}

#[test]
fn test_edit_newer_than_delete_resurfaces() {
    let (mut state, mut chat) = received("m1", ALICE, "hello", 10);
    apply_delete(&mut state, Some(&mut chat), ALICE, 20, ME).expect("Failed to delete");
    assert!(stored(&state).deleted);

    let effect = apply_edit(&mut state, Some(&mut chat), ALICE, "back", 21, ME)
        .expect("Failed to edit");
    assert!(effect.resurfaced);
    assert!(!stored(&state).deleted);
    assert_eq!(chat.unviewed_messages_count, 1);
}

#[test]
fn test_edit_older_than_delete_keeps_it_hidden() {
    let (mut state, mut chat) = received("m1", ALICE, "hello", 10);
    apply_delete(&mut state, Some(&mut chat), ALICE, 20, ME).expect("Failed to delete");
    apply_edit(&mut state, Some(&mut chat), ALICE, "late", 15, ME).expect("Failed to edit");
    assert!(stored(&state).deleted);
    assert_eq!(chat.unviewed_messages_count, 0);
}

#[test]
fn test_delete_for_me_requires_own_identity() {
    let (mut state, mut chat) = received("m1", ALICE, "hello", 10);
    let result = apply_delete_for_me(&mut state, Some(&mut chat), ALICE, 20, ME);
    assert!(matches!(result, Err(Error::Authority(_))));

    let effect = apply_delete_for_me(&mut state, Some(&mut chat), ME, 20, ME)
        .expect("Failed to hide");
    assert!(effect.hidden);
    assert!(stored(&state).deleted_for_me);
    assert!(!stored(&state).deleted);
}

#[test]
fn test_pin_does_not_resurface_deleted_message() {
    let (mut state, mut chat) = received("m1", ALICE, "hello", 10);
    apply_delete(&mut state, Some(&mut chat), ALICE, 20, ME).expect("Failed to delete");

    let effect = apply_pin(&mut state, Some(&mut chat), BOB, true, 30, ME);
    assert_eq!(effect.outcome, MergeOutcome::Applied);
    assert!(!effect.resurfaced);
    assert!(stored(&state).pinned);
    assert!(stored(&state).deleted);
}

#[test]
fn test_pin_last_writer_wins() {
    let (mut state, mut chat) = received("m1", ALICE, "hello", 10);
    apply_pin(&mut state, Some(&mut chat), BOB, true, 30, ME);
    let stale = apply_pin(&mut state, Some(&mut chat), ALICE, false, 25, ME);
    assert_eq!(stale.outcome, MergeOutcome::Stale);
    assert!(stored(&state).pinned);
    assert_eq!(stored(&state).pinned_by.as_deref(), Some(BOB));
}

#[test]
fn test_mark_seen_and_unread() {
    let (mut state, mut chat) = received("m1", ALICE, "hi @me", 10);
    let message = state.message.as_mut().expect("message should be stored");

    assert_eq!(mark_seen(message, &mut chat, ME), MergeOutcome::Applied);
    assert_eq!(mark_seen(message, &mut chat, ME), MergeOutcome::Stale);
    assert_eq!((chat.unviewed_messages_count, chat.unviewed_mentions_count), (0, 0));

    assert_eq!(mark_unread(message, &mut chat, ME), MergeOutcome::Applied);
    assert_eq!((chat.unviewed_messages_count, chat.unviewed_mentions_count), (1, 1));
}

#[test]
fn test_delete_after_counters_reset_does_not_underflow() {
    let (mut state, mut chat) = received("m1", ALICE, "hi @me", 10);
    chat.mark_all_read();

    apply_delete(&mut state, Some(&mut chat), ALICE, 20, ME).expect("Failed to delete");
    assert_eq!((chat.unviewed_messages_count, chat.unviewed_mentions_count), (0, 0));
}

#[test]
fn test_ingest_below_fence_is_not_stored() {
    let mut state = empty_state("m1");
    let mut chat = chat();
    chat.apply_deleted_at(50);

    let outcome = ingest(&mut state, message("m1", ALICE, "old", 40), &mut chat, ME, true);
    assert_eq!(outcome, MergeOutcome::Stale);
    assert!(state.message.is_none());
    assert_eq!(chat.unviewed_messages_count, 0);
}
