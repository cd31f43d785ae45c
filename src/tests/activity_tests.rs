// Activity Tests - Testing notification projection and record merging
use crate::activity;
use crate::contacts::{self, ContactMergeResult};
use crate::crypto::KeyPair;
use crate::storage::{
    ActivityCenterState, Contact, Message, Notification, NotificationKind, Resolution,
};
use crate::MergeOutcome;

const ME: &str = "me";
const ALICE: &str = "alice";

fn message(id: &str, from: &str, clock: u64) -> Message {
    Message::new(
        id.to_string(),
        "chat".to_string(),
        from.to_string(),
        "hello".to_string(),
        clock,
        clock,
    )
}

fn peer() -> Contact {
    let keypair = KeyPair::generate().expect("Failed to generate keypair");
    Contact::new(&keypair.public_key_hex()).expect("Failed to create contact")
}

#[test]
fn test_mention_produces_notification() {
    let mut msg = message("m1", ALICE, 10);
    msg.mentioned = true;

    let notifications = activity::for_message(&msg, None, ME);
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::Mention);
    assert_eq!(notifications[0].chat_id.as_deref(), Some("chat"));
    assert_eq!(notifications[0].message_id.as_deref(), Some("m1"));
    assert!(notifications[0].is_unread());
}

#[test]
fn test_reply_to_own_message_produces_notification() {
    let original = message("m1", ME, 5);
    let reply = message("m2", ALICE, 10).with_response_to(Some("m1".to_string()));

    let notifications = activity::for_message(&reply, Some(&original), ME);
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::Reply);
}

#[test]
fn test_reply_to_someone_else_is_silent() {
    let original = message("m1", "bob", 5);
    let reply = message("m2", ALICE, 10).with_response_to(Some("m1".to_string()));
    assert!(activity::for_message(&reply, Some(&original), ME).is_empty());
}

#[test]
fn test_own_and_hidden_messages_are_silent() {
    let mut own = message("m1", ME, 10);
    own.mentioned = true;
    assert!(activity::for_message(&own, None, ME).is_empty());

    let mut deleted = message("m2", ALICE, 10);
    deleted.mentioned = true;
    deleted.deleted = true;
    assert!(activity::for_message(&deleted, None, ME).is_empty());
}

#[test]
fn test_edited_mention_is_stamped_with_edit_clock() {
    let mut msg = message("m1", ALICE, 10);
    msg.mentioned = true;
    msg.edited_at = 25;

    let notifications = activity::for_message(&msg, None, ME);
    assert_eq!(notifications[0].updated_at, 25);
}

#[test]
fn test_contact_request_notification() {
    let contact = peer();
    let result = ContactMergeResult {
        outcome: MergeOutcome::Applied,
        new_request_received: true,
        became_mutual: false,
        removed_by_peer: false,
        send_back_state: false,
    };

    let notification = activity::for_contact(&contact, &result, 100)
        .expect("Failed to project request");
    assert_eq!(notification.kind, NotificationKind::ContactRequest);
    assert_eq!(notification.author, contact.id);
    assert_eq!(notification.resolution, Resolution::Pending);
}

#[test]
fn test_contact_removed_notification() {
    let mut contact = peer();
    contacts::send_request(&mut contact, 10);
    let result = ContactMergeResult {
        outcome: MergeOutcome::Applied,
        new_request_received: false,
        became_mutual: false,
        removed_by_peer: true,
        send_back_state: false,
    };

    let notification = activity::for_contact(&contact, &result, 100)
        .expect("Failed to project removal");
    assert_eq!(notification.kind, NotificationKind::ContactRemoved);
}

#[test]
fn test_contact_without_transition_is_silent() {
    let contact = peer();
    let result = ContactMergeResult {
        outcome: MergeOutcome::Stale,
        new_request_received: false,
        became_mutual: true,
        removed_by_peer: false,
        send_back_state: false,
    };
    assert!(activity::for_contact(&contact, &result, 100).is_none());
}

#[test]
fn test_request_ids_are_stable_per_subject() {
    let first = activity::for_request_to_join("community", ALICE, 10, 10);
    let again = activity::for_request_to_join("community", ALICE, 20, 20);
    let other = activity::for_request_to_join("community", "bob", 10, 10);

    assert_eq!(first.id, again.id);
    assert_ne!(first.id, other.id);
    assert_eq!(first.community_id.as_deref(), Some("community"));
}

#[test]
fn test_merge_keeps_stored_record_on_redelivery() {
    let mut stored = Notification::new(NotificationKind::Mention, "m1", ALICE, 10, 10);
    activity::mark_read(&mut stored, 11);

    let redelivered = Notification::new(NotificationKind::Mention, "m1", ALICE, 10, 10);
    let (merged, outcome) = activity::merge(Some(stored), redelivered);

    assert_eq!(outcome, MergeOutcome::Stale);
    assert!(merged.read);
}

#[test]
fn test_merge_newer_record_replaces_stored() {
    let mut stored = Notification::new(NotificationKind::ContactRequest, "peer", "peer", 10, 10);
    activity::resolve(&mut stored, Resolution::Dismissed, 11);

    let fresh = Notification::new(NotificationKind::ContactRequest, "peer", "peer", 40, 40);
    let (merged, outcome) = activity::merge(Some(stored), fresh);

    assert_eq!(outcome, MergeOutcome::Applied);
    assert_eq!(merged.resolution, Resolution::Pending);
    assert!(merged.is_unread());
}

#[test]
fn test_hide_is_idempotent() {
    let mut notification = Notification::new(NotificationKind::Mention, "m1", ALICE, 10, 10);
    assert_eq!(activity::hide(&mut notification, 20), MergeOutcome::Applied);
    assert_eq!(activity::hide(&mut notification, 30), MergeOutcome::Stale);
    assert!(notification.deleted);
    assert!(!notification.is_unread());
    assert_eq!(notification.updated_at, 20);
}

#[test]
fn test_mark_read_requires_newer_clock() {
    let mut notification = Notification::new(NotificationKind::Mention, "m1", ALICE, 10, 10);
    assert_eq!(activity::mark_read(&mut notification, 10), MergeOutcome::Stale);
    assert!(!notification.read);

    assert_eq!(activity::mark_read(&mut notification, 11), MergeOutcome::Applied);
    assert_eq!(activity::mark_read(&mut notification, 12), MergeOutcome::Stale);
    assert!(notification.read);
}

#[test]
fn test_resolve_marks_read() {
    let mut notification =
        Notification::new(NotificationKind::ContactRequest, "peer", "peer", 10, 10);
    assert_eq!(
        activity::resolve(&mut notification, Resolution::Accepted, 15),
        MergeOutcome::Applied
    );
    assert!(notification.read);
    assert_eq!(notification.resolution, Resolution::Accepted);
    assert_eq!(
        activity::resolve(&mut notification, Resolution::Accepted, 16),
        MergeOutcome::Stale
    );
}

#[test]
fn test_pending_requests_skip_own_and_resolved() {
    let inbound = Notification::new(NotificationKind::ContactRequest, "a", "a", 10, 10);
    let looped_back = Notification::new(NotificationKind::ContactRequest, ME, ME, 10, 10);
    let mut resolved = Notification::new(NotificationKind::ContactRequest, "b", "b", 10, 10);
    activity::resolve(&mut resolved, Resolution::Dismissed, 11);
    let mention = Notification::new(NotificationKind::Mention, "m1", "c", 10, 10);

    let all = vec![inbound.clone(), looped_back, resolved, mention];
    let pending = contacts::pending_requests(&all, ME);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, inbound.id);
}

#[test]
fn test_activity_center_state_lww() {
    let mut state = ActivityCenterState::default();
    assert_eq!(state.merge(true, 10), MergeOutcome::Applied);
    assert_eq!(state.merge(false, 10), MergeOutcome::Stale);
    assert_eq!(state.merge(false, 9), MergeOutcome::Stale);
    assert!(state.has_seen);
    assert_eq!(state.merge(false, 11), MergeOutcome::Applied);
    assert!(!state.has_seen);
}
