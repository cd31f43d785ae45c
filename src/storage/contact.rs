//! Contact entity and contact-request state
//!
//! This module handles:
//! - Contact struct representing a peer identity
//! - Local/remote contact-request states, each with its own clock
//! - Derived relationship flags (added, has added us, mutual)
//! - ENS name tracking and re-verification backoff
//!
//! State transitions live in [`crate::contacts`]; this module only stores and
//! derives.

use crate::crypto;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Contact request state
///
/// Stored local state is one of `None`, `Sent` or `Dismissed`; stored remote
/// state is one of `None` or `Received`. Accepting an incoming request is
/// sending ours, so `Accepted` is never stored: [`Contact::relationship`]
/// reports it once both sides have added each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ContactRequestState {
    /// No request
    #[default]
    None,
    /// We sent (or accepted) a request
    Sent,
    /// The peer sent (or accepted) a request
    Received,
    /// Both sides have added each other
    Accepted,
    /// We declined the peer's request
    Dismissed,
}

/// Contact-request state as exchanged on the wire
///
/// Always expressed from the point of view of the identity that sends it:
/// `local_*` is the sender's own stance, `remote_*` is what the sender
/// believes the receiver's stance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PropagatedState {
    /// Sender's own request state
    pub local_state: ContactRequestState,
    /// Clock of the sender's own state
    pub local_clock: u64,
    /// Sender's view of the receiver's state
    pub remote_state: ContactRequestState,
    /// Clock of that view
    pub remote_clock: u64,
}

/// Represents a contact (any peer identity we hold state for)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Public key hex (`0x` + 64 hex chars)
    pub id: String,
    /// Last display name the peer announced
    pub display_name: String,
    /// What we last told the peer
    pub local_state: ContactRequestState,
    /// Clock of `local_state`
    pub local_clock: u64,
    /// What the peer last told us
    pub remote_state: ContactRequestState,
    /// Clock of `remote_state`
    pub remote_clock: u64,
    /// Whether we blocked the peer
    pub blocked: bool,
    /// Clock of `blocked`
    pub blocked_clock: u64,
    /// Whether we removed the peer from our contacts
    pub removed: bool,
    /// Highest clock applied to this contact
    pub last_updated: u64,
    /// ENS name claimed by the peer
    pub ens_name: Option<String>,
    /// Whether `ens_name` has been verified
    pub ens_verified: bool,
    /// Failed verification attempts since the name was set
    pub verification_retries: u32,
    /// Wall time of the last verification attempt (ms)
    pub verified_at: u64,
    /// Clock of `ens_name`
    pub last_ens_clock_value: u64,
}

impl Contact {
    /// Create a contact with no relationship state
    ///
    /// # Errors
    /// `Error::Validation` if `id` is not a valid public key
    pub fn new(id: &str) -> Result<Self> {
        crypto::validate_public_key(id)?;
        Ok(Self {
            id: id.to_string(),
            display_name: String::new(),
            local_state: ContactRequestState::None,
            local_clock: 0,
            remote_state: ContactRequestState::None,
            remote_clock: 0,
            blocked: false,
            blocked_clock: 0,
            removed: false,
            last_updated: 0,
            ens_name: None,
            ens_verified: false,
            verification_retries: 0,
            verified_at: 0,
            last_ens_clock_value: 0,
        })
    }

    /// We have added the peer
    pub fn added(&self) -> bool {
        self.local_state == ContactRequestState::Sent
    }

    /// The peer has added us
    pub fn has_added_us(&self) -> bool {
        self.remote_state == ContactRequestState::Received
    }

    /// Both sides have added each other
    pub fn mutual(&self) -> bool {
        self.added() && self.has_added_us()
    }

    /// We declined the peer's request
    pub fn dismissed(&self) -> bool {
        self.local_state == ContactRequestState::Dismissed
    }

    /// The peer's request is waiting for our answer
    pub fn pending_incoming(&self) -> bool {
        self.has_added_us() && self.local_state == ContactRequestState::None
    }

    /// Our request is waiting for the peer's answer
    pub fn pending_outgoing(&self) -> bool {
        self.added() && !self.has_added_us()
    }

    /// Single-word summary of the relationship
    pub fn relationship(&self) -> ContactRequestState {
        if self.mutual() {
            ContactRequestState::Accepted
        } else if self.dismissed() {
            ContactRequestState::Dismissed
        } else if self.added() {
            ContactRequestState::Sent
        } else if self.has_added_us() {
            ContactRequestState::Received
        } else {
            ContactRequestState::None
        }
    }

    /// State to attach to outgoing messages for this peer
    pub fn propagated_state(&self) -> PropagatedState {
        PropagatedState {
            local_state: self.local_state,
            local_clock: self.local_clock,
            remote_state: self.remote_state,
            remote_clock: self.remote_clock,
        }
    }

    pub(crate) fn touch(&mut self, clock: u64) {
        self.last_updated = self.last_updated.max(clock);
    }

    /// Whether the ENS name is due for another verification attempt
    ///
    /// The first attempt is always due. After `retries` failures the next one
    /// waits `backoff_ms * retries * 2^retries` past the last attempt; nothing
    /// is due once `max_retries` is reached.
    pub fn ens_verification_due(&self, now_ms: u64, backoff_ms: u64, max_retries: u32) -> bool {
        if self.ens_name.is_none() || self.ens_verified {
            return false;
        }
        if self.verification_retries >= max_retries {
            return false;
        }
        if self.verification_retries == 0 {
            return true;
        }

        let retries = self.verification_retries as u64;
        let wait = backoff_ms
            .saturating_mul(retries)
            .saturating_mul(1u64.checked_shl(self.verification_retries).unwrap_or(u64::MAX));
        now_ms >= self.verified_at.saturating_add(wait)
    }

    /// Record the outcome of an ENS verification attempt
    pub fn record_ens_verification(&mut self, verified: bool, now_ms: u64) {
        self.verified_at = now_ms;
        if verified {
            self.ens_verified = true;
        } else {
            self.verification_retries = self.verification_retries.saturating_add(1);
        }
    }
}
