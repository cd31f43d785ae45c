//! Activity center projector
//!
//! Derives notification records from accepted changes. Every record has an ID
//! derived from its kind and subject, so re-delivery or re-sync recomputes the
//! same record instead of adding a duplicate, and record state only moves
//! forward in clock order.

use crate::clock::{self, MergeOutcome};
use crate::contacts::ContactMergeResult;
use crate::storage::{Contact, Message, Notification, NotificationKind, Resolution};

/// Mention and reply notifications for a newly visible message
pub fn for_message(message: &Message, replied_to: Option<&Message>, me: &str) -> Vec<Notification> {
    if message.from == me || !message.is_visible() {
        return Vec::new();
    }

    let clock = message.clock.max(message.edited_at);
    let mut notifications = Vec::new();

    if message.mentioned {
        notifications.push(
            Notification::new(
                NotificationKind::Mention,
                &message.id,
                &message.from,
                message.timestamp,
                clock,
            )
                .for_message(&message.chat_id, &message.id),
        );
    }

    if replied_to.is_some_and(|original| original.from == me) {
        notifications.push(
            Notification::new(
                NotificationKind::Reply,
                &message.id,
                &message.from,
                message.timestamp,
                clock,
            )
                .for_message(&message.chat_id, &message.id),
        );
    }

    notifications
}

/// Notification for a contact-request transition, if it produced one
pub fn for_contact(
    contact: &Contact,
    result: &ContactMergeResult,
    timestamp: u64,
) -> Option<Notification> {
    let kind = if result.new_request_received {
        NotificationKind::ContactRequest
    } else if result.removed_by_peer {
        NotificationKind::ContactRemoved
    } else {
        return None;
    };
    Some(Notification::new(
        kind,
        &contact.id,
        &contact.id,
        timestamp,
        contact.remote_clock,
    ))
}

/// Notification for a contact verification request
pub fn for_verification_request(from: &str, clock: u64, timestamp: u64) -> Notification {
    Notification::new(
        NotificationKind::ContactVerification,
        &verification_key(from),
        from,
        timestamp,
        clock,
    )
}

/// Subject key of the verification notification of `from`
pub fn verification_key(from: &str) -> String {
    format!("verification:{}", from)
}

/// Notification for a request to join a community we control
pub fn for_request_to_join(
    community_id: &str,
    requester: &str,
    clock: u64,
    timestamp: u64,
) -> Notification {
    Notification::new(
        NotificationKind::CommunityRequestToJoin,
        &format!("{}:{}", community_id, requester),
        requester,
        timestamp,
        clock,
    )
    .for_community(community_id)
}

/// Merge a freshly projected record with the stored one
///
/// A record stamped with a newer clock replaces the stored one entirely (a
/// new contact request after a retraction starts out unread and pending);
/// anything else keeps the stored record.
pub fn merge(
    existing: Option<Notification>,
    incoming: Notification) -> (Notification, MergeOutcome,
) {
    match existing {
        None => (incoming, MergeOutcome::Applied),
        Some(existing) if clock::newer(incoming.updated_at, existing.updated_at) => {
            (incoming, MergeOutcome::Applied)
        }
        Some(existing) => (existing, MergeOutcome::Stale),
    }
}

/// Hide a record whose subject went away
pub fn hide(notification: &mut Notification, clock: u64) -> MergeOutcome {
    if notification.deleted {
        return MergeOutcome::Stale;
    }
    notification.deleted = true;
    notification.updated_at = notification.updated_at.max(clock);
    MergeOutcome::Applied
}

/// Mark a record read at `clock`
pub fn mark_read(notification: &mut Notification, clock: u64) -> MergeOutcome {
    if notification.read {
        return MergeOutcome::Stale;
    }
    notification.apply_state(Some(true), None, clock)
}

/// Accept or dismiss a record at `clock`
pub fn resolve(
    notification: &mut Notification,
    resolution: Resolution,
    clock: u64,
) -> MergeOutcome {
    if notification.resolution == resolution {
        return MergeOutcome::Stale;
    }
    notification.apply_state(None, Some(resolution), clock)
}
