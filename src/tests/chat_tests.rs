// Chat Tests - Testing chat IDs, clocks, deletion fence and group membership
use crate::clock::{ManualClock, MergeOutcome};
use crate::crypto::KeyPair;
use crate::protocol::{MembershipEvent, MembershipEventKind};
use crate::storage::chat::{community_chat_id, group_owner, validate_id};
use crate::storage::{Chat, ChatType, Message};
use crate::Error;

fn keypair() -> KeyPair {
    KeyPair::generate().expect("Failed to generate keypair")
}

fn message(id: &str, chat_id: &str, from: &str, clock: u64) -> Message {
    Message::new(
        id.to_string(),
        chat_id.to_string(),
        from.to_string(),
        format!("text of {}", id),
        clock,
        clock,
    )
}

fn event(
    keypair: &KeyPair,
    chat_id: &str,
    clock: u64,
    kind: MembershipEventKind,
) -> MembershipEvent {
    MembershipEvent::signed(keypair, chat_id, clock, kind).expect("Failed to sign membership event")
}

#[test]
fn test_chat_factories_produce_valid_ids() {
    let source = ManualClock::new(1_000);
    let peer = keypair().public_key_hex();

    let one_to_one = Chat::one_to_one(&peer, &source).expect("Failed to create chat");
    assert_eq!(one_to_one.id, peer);
    assert!(validate_id(&one_to_one.id, ChatType::OneToOne).is_ok());

    let public = Chat::public("status", &source).expect("Failed to create chat");
    assert!(validate_id(&public.id, ChatType::Public).is_ok());

    let profile = Chat::profile(&peer, &source).expect("Failed to create chat");
    assert!(validate_id(&profile.id, ChatType::Profile).is_ok());

    let timeline = Chat::timeline(&peer, &source).expect("Failed to create chat");
    assert!(validate_id(&timeline.id, ChatType::Timeline).is_ok());

    let community = Chat::community_chat(&peer, "general", &source).expect("Failed to create chat");
    assert_eq!(community.id, community_chat_id(&peer, "general"));
    assert!(validate_id(&community.id, ChatType::CommunityChat).is_ok());
}

#[test]
fn test_private_group_id_encodes_owner() {
    let source = ManualClock::new(1_000);
    let owner = keypair().public_key_hex();

    let group = Chat::private_group(&owner, &source).expect("Failed to create group");
    assert_eq!(group_owner(&group.id).expect("Failed to parse owner"), owner);
    assert!(!group.active);
}

#[test]
fn test_validate_id_rejects_malformed() {
    let cases = [
        ("0x1234", ChatType::OneToOne),
        ("Upper Case", ChatType::Public),
        ("", ChatType::Public),
        ("profile", ChatType::Profile),
        ("@timeline", ChatType::Timeline),
        ("no-owner", ChatType::PrivateGroup),
        ("short", ChatType::CommunityChat),
    ];
    for (id, chat_type) in cases {
        assert!(
            matches!(validate_id(id, chat_type), Err(Error::Validation(_))),
            "{:?} accepted as {:?}",
            id,
            chat_type
        );
    }
}

#[test]
fn test_next_clock_is_strictly_increasing() {
    let source = ManualClock::new(1_000);
    let mut chat = Chat::public("status", &source).expect("Failed to create chat");

    let (first, _) = chat.next_clock_and_timestamp(&source);
    let (second, _) = chat.next_clock_and_timestamp(&source);
    assert_eq!(first, 1_000);
    assert_eq!(second, 1_001);
    assert_eq!(chat.last_clock_value, 1_001);

    chat.observe_clock(5_000);
    let (third, _) = chat.next_clock_and_timestamp(&source);
    assert_eq!(third, 5_001);
}

#[test]
fn test_inbound_message_sets_last_message_and_clock() {
    let source = ManualClock::new(1_000);
    let mut chat = Chat::public("status", &source).expect("Failed to create chat");

    let first = message("m1", "status", "0xa", 20);
    let older = message("m0", "status", "0xa", 10);

    assert_eq!(chat.apply_inbound_message(&first, false), MergeOutcome::Applied);
    assert_eq!(chat.apply_inbound_message(&older, false), MergeOutcome::Applied);

    assert_eq!(chat.last_message.as_ref().map(|m| m.id.as_str()), Some("m1"));
    assert_eq!(chat.last_clock_value, 20);
}

#[test]
fn test_last_message_tie_broken_by_id() {
    let source = ManualClock::new(1_000);
    let mut forward = Chat::public("status", &source).expect("Failed to create chat");
    let mut backward = forward.clone();

    let a = message("a", "status", "0xa", 20);
    let b = message("b", "status", "0xb", 20);

    forward.apply_inbound_message(&a, false);
    forward.apply_inbound_message(&b, false);
    backward.apply_inbound_message(&b, false);
    backward.apply_inbound_message(&a, false);

    assert_eq!(forward.last_message, backward.last_message);
    assert_eq!(forward.last_message.map(|m| m.id), Some("b".to_string()));
}

#[test]
fn test_deletion_fence_discards_older_messages() {
    let source = ManualClock::new(1_000);
    let mut chat = Chat::public("status", &source).expect("Failed to create chat");
    chat.apply_inbound_message(&message("m1", "status", "0xa", 500), true);
    chat.unviewed_messages_count = 3;

    let fence = chat.soft_delete(&source);
    assert_eq!(fence, 1_000);
    assert!(!chat.active);
    assert!(chat.last_message.is_none());
    assert_eq!(chat.unviewed_messages_count, 0);

    let replayed = message("m1", "status", "0xa", 500);
    assert_eq!(chat.apply_inbound_message(&replayed, true), MergeOutcome::Stale);
    let at_fence = message("m2", "status", "0xa", fence);
    assert_eq!(chat.apply_inbound_message(&at_fence, true), MergeOutcome::Stale);
    assert!(chat.last_message.is_none());

    let after = message("m3", "status", "0xa", fence + 1);
    assert_eq!(chat.apply_inbound_message(&after, true), MergeOutcome::Applied);
    assert!(chat.active);
}

#[test]
fn test_apply_deleted_at_is_last_writer_wins() {
    let source = ManualClock::new(1_000);
    let mut chat = Chat::public("status", &source).expect("Failed to create chat");

    assert_eq!(chat.apply_deleted_at(300), MergeOutcome::Applied);
    assert_eq!(chat.apply_deleted_at(200), MergeOutcome::Stale);
    assert_eq!(chat.apply_deleted_at(300), MergeOutcome::Stale);
    assert_eq!(chat.deleted_at_clock_value, 300);
}

#[test]
fn test_hidden_last_message_requests_refresh() {
    let source = ManualClock::new(1_000);
    let mut chat = Chat::public("status", &source).expect("Failed to create chat");
    let earlier = message("m1", "status", "0xa", 10);
    let mut last = message("m2", "status", "0xa", 20);
    chat.apply_inbound_message(&earlier, false);
    chat.apply_inbound_message(&last, false);

    last.deleted = true;
    assert!(chat.offer_last_message(&last));
    assert!(chat.last_message.is_none());

    chat.refresh_last_message(Some(earlier.clone()));
    assert_eq!(chat.last_message, Some(earlier));
}

#[test]
fn test_adjust_unread_saturates() {
    let source = ManualClock::new(1_000);
    let mut chat = Chat::public("status", &source).expect("Failed to create chat");

    chat.adjust_unread((0, 0), (1, 1));
    assert_eq!((chat.unviewed_messages_count, chat.unviewed_mentions_count), (1, 1));

    chat.mark_all_read();
    chat.adjust_unread((1, 1), (0, 0));
    assert_eq!((chat.unviewed_messages_count, chat.unviewed_mentions_count), (0, 0));
}

#[test]
fn test_membership_create_invite_join() {
    let source = ManualClock::new(1_000);
    let owner = keypair();
    let member = keypair();
    let mut chat = Chat::private_group(&owner.public_key_hex(), &source)
        .expect("Failed to create group");
    let id = chat.id.clone();

    let events = vec![
        event(&owner, &id, 1, MembershipEventKind::ChatCreated { name: "team".to_string() }),
        event(
            &owner,
            &id,
            2,
            MembershipEventKind::MembersAdded {
                members: vec![member.public_key_hex()],
            },
        ),
    ];

    let change = chat
        .apply_membership_events(&events, &member.public_key_hex())
        .expect("Failed to apply membership");
    assert_eq!(change.outcome, MergeOutcome::Applied);
    assert!(!change.joined);
    assert_eq!(chat.name, "team");
    assert!(chat.is_admin(&owner.public_key_hex()));
    assert!(!chat.is_joined_member(&member.public_key_hex()));
    assert!(!chat.active);

    let joined = event(&member, &id, 3, MembershipEventKind::MemberJoined);
    let change = chat
        .apply_membership_events(&[joined], &member.public_key_hex())
        .expect("Failed to apply join");
    assert!(change.joined);
    assert!(chat.active);
    assert_eq!(chat.last_clock_value, 3);
}

#[test]
fn test_membership_order_independent() {
    let source = ManualClock::new(1_000);
    let owner = keypair();
    let member = keypair();
    let base = Chat::private_group(&owner.public_key_hex(), &source)
        .expect("Failed to create group");
    let id = base.id.clone();

    let created = event(
        &owner,
        &id,
        1,
        MembershipEventKind::ChatCreated { name: "team".to_string() },
    );
    let added = event(
        &owner,
        &id,
        2,
        MembershipEventKind::MembersAdded {
            members: vec![member.public_key_hex()],
        },
    );
    let joined = event(&member, &id, 3, MembershipEventKind::MemberJoined);

    let me = owner.public_key_hex();
    let mut forward = base.clone();
    forward
        .apply_membership_events(&[created.clone(), added.clone(), joined.clone()], &me)
        .expect("Failed to apply forward");

    let mut backward = base.clone();
    backward
        .apply_membership_events(&[joined.clone(), created.clone(), added.clone()], &me)
        .expect("Failed to apply backward");

    assert_eq!(forward.members, backward.members);
    assert_eq!(forward.membership_log, backward.membership_log);

    let change = forward
        .apply_membership_events(&[added], &me)
        .expect("Failed to re-apply");
    assert_eq!(change.outcome, MergeOutcome::Stale);
}

#[test]
fn test_membership_non_admin_rejected() {
    let source = ManualClock::new(1_000);
    let owner = keypair();
    let member = keypair();
    let outsider = keypair();
    let mut chat = Chat::private_group(&owner.public_key_hex(), &source)
        .expect("Failed to create group");
    let id = chat.id.clone();

    chat.apply_membership_events(
        &[
            event(&owner, &id, 1, MembershipEventKind::ChatCreated { name: "team".to_string() }),
            event(
                &owner,
                &id,
                2,
                MembershipEventKind::MembersAdded {
                    members: vec![member.public_key_hex()],
                },
            ),
        ],
        &owner.public_key_hex(),
    )
    .expect("Failed to create group");
    let before = chat.clone();

    let forged = event(
        &member,
        &id,
        3,
        MembershipEventKind::MembersAdded {
            members: vec![outsider.public_key_hex()],
        },
    );
    let result = chat.apply_membership_events(&[forged], &owner.public_key_hex());
    assert!(matches!(result, Err(Error::Authority(_))));
    assert_eq!(chat, before);
}

#[test]
fn test_membership_log_must_start_with_creation() {
    let source = ManualClock::new(1_000);
    let owner = keypair();
    let impostor = keypair();
    let mut chat = Chat::private_group(&owner.public_key_hex(), &source)
        .expect("Failed to create group");
    let id = chat.id.clone();

    let created_by_impostor = event(
        &impostor,
        &id,
        1,
        MembershipEventKind::ChatCreated { name: "x".to_string() },
    );
    let result = chat.apply_membership_events(&[created_by_impostor], &owner.public_key_hex());
    assert!(matches!(result, Err(Error::Validation(_))));
}

#[test]
fn test_member_leaving_deactivates_chat() {
    let source = ManualClock::new(1_000);
    let owner = keypair();
    let mut chat = Chat::private_group(&owner.public_key_hex(), &source)
        .expect("Failed to create group");
    let id = chat.id.clone();
    let me = owner.public_key_hex();

    chat.apply_membership_events(
        &[event(&owner, &id, 1, MembershipEventKind::ChatCreated { name: "team".to_string() })],
        &me,
    )
    .expect("Failed to create group");
    assert!(chat.active);

    let change = chat
        .apply_membership_events(&[event(&owner, &id, 2, MembershipEventKind::MemberLeft)], &me)
        .expect("Failed to leave");
    assert!(change.left);
    assert!(!chat.active);
}

#[test]
fn test_membership_event_signature() {
    let owner = keypair();
    let other = keypair();
    let mut signed = event(&owner, "chat", 1, MembershipEventKind::MemberJoined);
    assert!(signed.verify("chat").is_ok());
    assert!(matches!(signed.verify("other-chat"), Err(Error::Validation(_))));

    signed.from = other.public_key_hex();
    assert!(matches!(signed.verify("chat"), Err(Error::Validation(_))));
}

#[test]
fn test_membership_on_non_group_rejected() {
    let source = ManualClock::new(1_000);
    let owner = keypair();
    let mut chat = Chat::public("status", &source).expect("Failed to create chat");
    let created = event(
        &owner,
        "status",
        1,
        MembershipEventKind::ChatCreated { name: "x".to_string() },
    );
    assert!(matches!(
        chat.apply_membership_events(&[created], &owner.public_key_hex()),
        Err(Error::Validation(_))
    ));
}

#[test]
fn test_membership_at_message_clock() {
    let source = ManualClock::new(1_000);
    let owner = keypair();
    let member = keypair();
    let mut chat = Chat::private_group(&owner.public_key_hex(), &source)
        .expect("Failed to create group");
    let id = chat.id.clone();
    let member_key = member.public_key_hex();

    assert!(chat.was_member_at(&member_key, 5).expect("Failed to check membership"));

    chat.apply_membership_events(
        &[
            event(&owner, &id, 10, MembershipEventKind::ChatCreated { name: "team".to_string() }),
            event(
                &owner,
                &id,
                20,
                MembershipEventKind::MembersAdded {
                    members: vec![member_key.clone()],
                },
            ),
            event(
                &owner,
                &id,
                40,
                MembershipEventKind::MemberRemoved {
                    member: member_key.clone(),
                },
            ),
        ],
        &owner.public_key_hex(),
    )
    .expect("Failed to apply membership");

    assert!(!chat.was_member_at(&owner.public_key_hex(), 5).expect("Failed to check membership"));
    assert!(!chat.was_member_at(&member_key, 15).expect("Failed to check membership"));
    assert!(chat.was_member_at(&member_key, 30).expect("Failed to check membership"));
    assert!(!chat.was_member_at(&member_key, 40).expect("Failed to check membership"));
    assert!(!chat.members.contains_key(&member_key));
}
