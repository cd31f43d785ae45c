//! Contact reconciliation
//!
//! Local actions (send, accept, decline, retract, block) and propagated state
//! from peers or paired devices all go through the functions in this module.
//! Each of the two state/clock pairs of a [`Contact`] is merged
//! independently: a pair only moves when the incoming clock is strictly newer.

use crate::clock::{self, MergeOutcome};
use crate::storage::{
    Contact, ContactRequestState, Notification, NotificationKind, PropagatedState, Resolution,
};
use tracing::debug;

/// What a merge did to a contact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactMergeResult {
    /// Whether any state changed
    pub outcome: MergeOutcome,
    /// The peer's request became pending on our side
    pub new_request_received: bool,
    /// The relationship became mutual
    pub became_mutual: bool,
    /// The peer stopped having us as a contact
    pub removed_by_peer: bool,
    /// Our state is newer than what the peer believes; send it back
    pub send_back_state: bool,
}

struct Snapshot {
    pending_incoming: bool,
    mutual: bool,
    has_added_us: bool,
    state: (ContactRequestState, u64, ContactRequestState, u64),
}

impl Snapshot {
    fn of(contact: &Contact) -> Self {
        Self {
            pending_incoming: contact.pending_incoming(),
            mutual: contact.mutual(),
            has_added_us: contact.has_added_us(),
            state: (
                contact.local_state,
                contact.local_clock,
                contact.remote_state,
                contact.remote_clock,
            ),
        }
    }

    fn result(&self, contact: &Contact, send_back_state: bool) -> ContactMergeResult {
        let after = Snapshot::of(contact);
        ContactMergeResult {
            outcome: MergeOutcome::from_applied(self.state != after.state),
            new_request_received: !self.pending_incoming && after.pending_incoming,
            became_mutual: !self.mutual && after.mutual,
            removed_by_peer: self.has_added_us && !after.has_added_us,
            send_back_state,
        }
    }
}

fn set_local(contact: &mut Contact, state: ContactRequestState, clock: u64) {
    contact.local_state = state;
    contact.local_clock = clock;
    contact.touch(clock);
}

fn set_remote(contact: &mut Contact, state: ContactRequestState, clock: u64) {
    contact.remote_state = state;
    contact.remote_clock = clock;
    contact.touch(clock);
}

/// Send a contact request, or accept the peer's pending one
pub fn send_request(contact: &mut Contact, clock: u64) -> ContactMergeResult {
    let before = Snapshot::of(contact);
    if clock::newer(clock, contact.local_clock) {
        set_local(contact, ContactRequestState::Sent, clock);
        contact.removed = false;
    }
    before.result(contact, false)
}

/// Accept the peer's pending request
///
/// Accepting is sending our own request, so the relationship becomes mutual.
pub fn accept_request(contact: &mut Contact, clock: u64) -> ContactMergeResult {
    send_request(contact, clock)
}

/// Decline the peer's pending request
pub fn dismiss_request(contact: &mut Contact, clock: u64) -> ContactMergeResult {
    let before = Snapshot::of(contact);
    if clock::newer(clock, contact.local_clock) {
        set_local(contact, ContactRequestState::Dismissed, clock);
    }
    before.result(contact, false)
}

/// Remove the peer from our contacts
///
/// Both pairs are reset at the same clock so that everything either side
/// said before the retraction is superseded.
pub fn retract_request(contact: &mut Contact, clock: u64) -> ContactMergeResult {
    let before = Snapshot::of(contact);
    if clock::newer(clock, contact.local_clock) {
        set_local(contact, ContactRequestState::None, clock);
    }
    if clock::newer(clock, contact.remote_clock) {
        set_remote(contact, ContactRequestState::None, clock);
    }
    contact.removed = true;
    before.result(contact, false)
}

/// The peer sent (or accepted) a request at `clock`
fn request_received(contact: &mut Contact, clock: u64) {
    set_remote(contact, ContactRequestState::Received, clock);
}

/// The peer retracted at `clock`
///
/// Retraction is symmetric: our own request is dropped too, unless we had
/// dismissed theirs.
fn request_retracted(contact: &mut Contact, clock: u64) {
    set_remote(contact, ContactRequestState::None, clock);
    if !contact.dismissed() && clock::newer(clock, contact.local_clock) {
        set_local(contact, ContactRequestState::None, clock);
    }
}

/// Merge contact-request state propagated by the peer
///
/// The incoming state is expressed from the peer's side and is swapped here:
/// the peer's `remote_*` pair is its view of our local state, its `local_*`
/// pair becomes our remote state.
pub fn merge_propagated_state(
    contact: &mut Contact,
    incoming: &PropagatedState,
) -> ContactMergeResult {
    let before = Snapshot::of(contact);

    let expected_local = match incoming.remote_state {
        ContactRequestState::Sent
        | ContactRequestState::Received
        | ContactRequestState::Accepted => {
            ContactRequestState::Sent
        }
        _ => ContactRequestState::None,
    };
    let our_local = if contact.added() {
        ContactRequestState::Sent
    } else {
        ContactRequestState::None
    };

    if clock::newer(incoming.remote_clock, contact.local_clock)
        && expected_local == ContactRequestState::None
        && !contact.dismissed()
    {
        debug!("Peer {} no longer has our request, clearing it", contact.id);
        set_local(contact, ContactRequestState::None, incoming.remote_clock);
    }

    let send_back_state =
        incoming.remote_clock < contact.local_clock && expected_local != our_local;

    if clock::newer(incoming.local_clock, contact.remote_clock) {
        match incoming.local_state {
            ContactRequestState::Sent | ContactRequestState::Accepted => {
                request_received(contact, incoming.local_clock)
            }
            ContactRequestState::None => request_retracted(contact, incoming.local_clock),
            ContactRequestState::Dismissed | ContactRequestState::Received => {
                set_remote(contact, ContactRequestState::None, incoming.local_clock)
            }
        }
    }

    before.result(contact, send_back_state)
}

/// Merge contact state replicated from one of our own devices
///
/// No swap: both pairs are already from our side, with their original clocks.
pub fn merge_paired_state(contact: &mut Contact, incoming: &PropagatedState) -> ContactMergeResult {
    let before = Snapshot::of(contact);

    if clock::newer(incoming.local_clock, contact.local_clock) {
        let was_added = contact.added();
        set_local(contact, incoming.local_state, incoming.local_clock);
        if contact.added() {
            contact.removed = false;
        } else if was_added {
            contact.removed = true;
        }
    }
    if clock::newer(incoming.remote_clock, contact.remote_clock) {
        set_remote(contact, incoming.remote_state, incoming.remote_clock);
    }

    before.result(contact, false)
}

/// Block or unblock the peer at `clock`
///
/// Blocking also retracts any request in either direction.
pub fn set_blocked(contact: &mut Contact, blocked: bool, clock: u64) -> MergeOutcome {
    if !clock::newer(clock, contact.blocked_clock) {
        return MergeOutcome::Stale;
    }
    contact.blocked = blocked;
    contact.blocked_clock = clock;
    contact.touch(clock);
    if blocked {
        retract_request(contact, clock);
    }
    MergeOutcome::Applied
}

/// Set the ENS name the peer claims, last writer wins
///
/// A new name resets its verification state.
pub fn set_ens_name(contact: &mut Contact, name: &str, clock: u64) -> MergeOutcome {
    if !clock::newer(clock, contact.last_ens_clock_value) {
        return MergeOutcome::Stale;
    }
    if contact.ens_name.as_deref() != Some(name) {
        contact.ens_name = Some(name.to_string());
        contact.ens_verified = false;
        contact.verification_retries = 0;
        contact.verified_at = 0;
    }
    contact.last_ens_clock_value = clock;
    contact.touch(clock);
    MergeOutcome::Applied
}

/// Contact requests waiting for the local user's answer
///
/// Requests authored by the local identity are filtered out even when they are
/// stored with the same shape as inbound ones.
pub fn pending_requests<'a>(notifications: &'a [Notification], me: &str) -> Vec<&'a Notification> {
    notifications
        .iter()
        .filter(|n| n.kind == NotificationKind::ContactRequest)
        .filter(|n| !n.deleted && n.resolution == Resolution::Pending)
        .filter(|n| n.author != me)
        .collect()
}
