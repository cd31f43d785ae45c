//! Protocol module
//!
//! This module defines the wire format consumed by the reconciliation core:
//! - `Event`, the closed set of typed events peers exchange
//! - `Envelope`, the signed (and optionally group-encrypted) container
//! - Serialization/deserialization (CBOR on the wire, JSON for debugging)
//!
//! `Envelope::open` is the decode step: it verifies the signature, decrypts
//! group payloads and returns the typed event with its sender.

use crate::crypto::{self, GroupCiphertext, HashRatchet, KeyPair};
use crate::storage::{ChatType, PropagatedState, Resolution};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Regular chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Chat the message belongs to, from the sender's point of view
    pub chat_id: String,
    /// Kind of chat
    pub chat_type: ChatType,
    /// Logical clock of the message
    pub clock: u64,
    /// Wall time at which the message was created (ms)
    pub timestamp: u64,
    /// Message text
    pub text: String,
    /// ID of the message this one replies to
    pub response_to: Option<String>,
    /// Sender's contact request state, carried on one-to-one messages
    pub contact_state: Option<PropagatedState>,
}

/// Edit of an existing message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditMessage {
    /// Chat of the target message
    pub chat_id: String,
    /// Target message
    pub message_id: String,
    /// Clock of the edit
    pub clock: u64,
    /// Replacement text
    pub text: String,
}

/// Delete of a message for everyone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMessage {
    /// Chat of the target message
    pub chat_id: String,
    /// Target message
    pub message_id: String,
    /// Clock of the delete
    pub clock: u64,
}

/// Delete of a message on this identity's devices only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteForMe {
    /// Chat of the target message
    pub chat_id: String,
    /// Target message
    pub message_id: String,
    /// Clock of the delete
    pub clock: u64,
}

/// Pin or unpin of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinMessage {
    /// Chat of the target message
    pub chat_id: String,
    /// Target message
    pub message_id: String,
    /// Clock of the pin change
    pub clock: u64,
    /// `true` to pin, `false` to unpin
    pub pinned: bool,
}

/// Kind of a private-group membership event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipEventKind {
    /// Group created by the event author, who becomes its first admin
    ChatCreated {
        /// Initial group name
        name: String,
    },
    /// Group renamed
    NameChanged {
        /// New group name
        name: String,
    },
    /// Members invited by an admin
    MembersAdded {
        /// Invited public keys
        members: Vec<String>,
    },
    /// Author accepted an invitation
    MemberJoined,
    /// Author left the group
    MemberLeft,
    /// Member removed by an admin
    MemberRemoved {
        /// Removed public key
        member: String,
    },
    /// Members promoted to admin
    AdminsAdded {
        /// Promoted public keys
        members: Vec<String>,
    },
    /// Admin demoted
    AdminRemoved {
        /// Demoted public key
        member: String,
    },
}

/// Signed entry in a private group's membership log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    /// Clock the event was emitted at
    pub clock: u64,
    /// Author of the event
    pub from: String,
    /// What happened
    pub kind: MembershipEventKind,
    /// Author's signature over chat ID, clock and kind
    pub signature: Vec<u8>,
}

impl MembershipEvent {
    fn signing_bytes(chat_id: &str, clock: u64, kind: &MembershipEventKind) -> Result<Vec<u8>> {
        serde_cbor::to_vec(&(chat_id, clock, kind))
            .map_err(|e| Error::CborSerialization(e.to_string()))
    }

    /// Create an event for `chat_id` signed by `keypair`
    pub fn signed(
        keypair: &KeyPair,
        chat_id: &str,
        clock: u64,
        kind: MembershipEventKind,
    ) -> Result<Self> {
        let signature = keypair.sign(&Self::signing_bytes(chat_id, clock, &kind)?)?;
        Ok(Self {
            clock,
            from: keypair.public_key_hex(),
            kind,
            signature,
        })
    }

    /// Check that `from` signed this event for `chat_id`
    ///
    /// # Errors
    /// `Error::Validation` on a malformed author key or a bad signature
    pub fn verify(&self, chat_id: &str) -> Result<()> {
        let bytes = Self::signing_bytes(chat_id, self.clock, &self.kind)?;
        if !crypto::verify_signature(&self.from, &bytes, &self.signature)? {
            return Err(Error::Validation(format!(
                "bad membership event signature from {} in {}",
                self.from, chat_id
            )));
        }
        Ok(())
    }
}

/// Batch of membership events for a private group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipUpdate {
    /// Group chat ID
    pub chat_id: String,
    /// Events known to the sender
    pub events: Vec<MembershipEvent>,
}

/// Contact request state propagated to a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactUpdate {
    /// Clock of the update
    pub clock: u64,
    /// Sender's display name
    pub display_name: String,
    /// Sender's view of the relationship
    pub state: PropagatedState,
}

/// Contact state replicated between devices of the same identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncContact {
    /// Contact public key
    pub contact_id: String,
    /// Relationship state with its original clocks
    pub state: PropagatedState,
    /// Blocked flag
    pub blocked: bool,
    /// Clock of the blocked flag
    pub blocked_clock: u64,
    /// ENS name and the clock it was set at
    pub ens_name: Option<(String, u64)>,
}

/// Chat history cleared on another device of the same identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncClearHistory {
    /// Cleared chat
    pub chat_id: String,
    /// Deletion fence
    pub clock: u64,
}

/// Whether a key exchange rotates the group secret or reuses it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyExchangeKind {
    /// Establish or rotate the group secret
    Rekey,
    /// Share the existing secret with new members
    Reuse,
}

/// Group key distributed by a community control node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchange {
    /// Community the group belongs to
    pub community_id: String,
    /// Hash-ratchet group
    pub group_id: String,
    /// Rekey or reuse
    pub kind: KeyExchangeKind,
    /// Key generation carried
    pub key_id: u32,
    /// Recipients the key is meant for
    pub recipients: Vec<String>,
    /// Key material sealed by the `HashRatchet`
    pub sealed_key: Vec<u8>,
}

/// Request to join a community, addressed to its control node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityRequestToJoin {
    /// Community to join
    pub community_id: String,
    /// Clock of the request
    pub clock: u64,
}

/// Request to verify a contact's identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactVerificationRequest {
    /// Clock of the request
    pub clock: u64,
    /// Challenge text shown to the verifier
    pub challenge: String,
}

/// Answer to a contact verification request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactVerificationResponse {
    /// Clock of the answer
    pub clock: u64,
    /// Whether the request was accepted
    pub accepted: bool,
    /// Answer to the challenge
    pub response: String,
}

/// Notification state change replicated between own devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncActivityCenterUpdate {
    /// Notifications affected
    pub ids: Vec<String>,
    /// Clock of the change
    pub clock: u64,
    /// New read flag, if changed
    pub read: Option<bool>,
    /// New resolution, if changed
    pub resolution: Option<Resolution>,
}

/// "Has seen" cursor replicated between own devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncActivityCenterState {
    /// Whether the activity center was opened
    pub has_seen: bool,
    /// Clock of the change
    pub updated_at: u64,
}

/// Typed event carried by an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// New chat message
    ChatMessage(ChatMessage),
    /// Edit of a message
    EditMessage(EditMessage),
    /// Delete for everyone
    DeleteMessage(DeleteMessage),
    /// Delete on own devices
    DeleteForMe(DeleteForMe),
    /// Pin or unpin
    PinMessage(PinMessage),
    /// Private group membership log
    MembershipUpdate(MembershipUpdate),
    /// Contact request state from a peer
    ContactUpdate(ContactUpdate),
    /// Contact state from a paired device
    SyncContact(SyncContact),
    /// Chat soft-delete from a paired device
    SyncClearHistory(SyncClearHistory),
    /// Community group key
    KeyExchange(KeyExchange),
    /// Request to join a community
    CommunityRequestToJoin(CommunityRequestToJoin),
    /// Contact verification request
    ContactVerificationRequest(ContactVerificationRequest),
    /// Contact verification answer
    ContactVerificationResponse(ContactVerificationResponse),
    /// Notification state change from a paired device
    SyncActivityCenterUpdate(SyncActivityCenterUpdate),
    /// Activity center "has seen" cursor from a paired device
    SyncActivityCenterState(SyncActivityCenterState),
}

impl Event {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ChatMessage(_) => "chat_message",
            Event::EditMessage(_) => "edit_message",
            Event::DeleteMessage(_) => "delete_message",
            Event::DeleteForMe(_) => "delete_for_me",
            Event::PinMessage(_) => "pin_message",
            Event::MembershipUpdate(_) => "membership_update",
            Event::ContactUpdate(_) => "contact_update",
            Event::SyncContact(_) => "sync_contact",
            Event::SyncClearHistory(_) => "sync_clear_history",
            Event::KeyExchange(_) => "key_exchange",
            Event::CommunityRequestToJoin(_) => "community_request_to_join",
            Event::ContactVerificationRequest(_) => "contact_verification_request",
            Event::ContactVerificationResponse(_) => "contact_verification_response",
            Event::SyncActivityCenterUpdate(_) => "sync_activity_center_update",
            Event::SyncActivityCenterState(_) => "sync_activity_center_state",
        }
    }

    /// Encode the event to CBOR format
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        serde_cbor::to_vec(self).map_err(|e| Error::CborSerialization(e.to_string()))
    }

    /// Decode an event from CBOR format
    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        serde_cbor::from_slice(data)
            .map_err(|e| Error::Validation(format!("malformed event: {}", e)))
    }
}

/// Body of an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    /// CBOR-encoded event
    Plain(Vec<u8>),
    /// CBOR-encoded event sealed under a group key
    Group(GroupCiphertext),
}

/// Signed envelope that wraps every event on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking
    pub version: u8,
    /// Sender's public key (`0x` hex)
    pub from: String,
    /// Ed25519 signature over the CBOR-encoded body
    pub signature: Vec<u8>,
    /// Payload
    pub body: Body,
}

/// Event recovered from an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// The typed event
    pub event: Event,
    /// Verified sender public key
    pub sender: String,
    /// Content-derived ID (signer + event payload)
    pub message_id: String,
}

/// Result of opening an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opened {
    /// Event decoded and verified
    Event(Decoded),
    /// Group payload whose key has not arrived yet
    MissingKey {
        /// Group the payload is sealed for
        group_id: String,
        /// Key generation required
        key_id: u32,
    },
}

impl Envelope {
    fn signed(keypair: &KeyPair, body: Body) -> Result<Self> {
        let body_bytes = serde_cbor::to_vec(&body)
            .map_err(|e| Error::CborSerialization(e.to_string()))?;
        Ok(Self {
            version: PROTOCOL_VERSION,
            from: keypair.public_key_hex(),
            signature: keypair.sign(&body_bytes)?,
            body,
        })
    }

    /// Sign a plaintext event
    pub fn seal(keypair: &KeyPair, event: &Event) -> Result<Self> {
        Self::signed(keypair, Body::Plain(event.to_cbor()?))
    }

    /// Sign an event encrypted under the current key of `group_id`
    pub fn seal_for_group(
        keypair: &KeyPair,
        event: &Event,
        ratchet: &dyn HashRatchet,
        group_id: &str,
    ) -> Result<Self> {
        let ciphertext = ratchet.encrypt(group_id, &event.to_cbor()?)?;
        Self::signed(keypair, Body::Group(ciphertext))
    }

    /// Content-derived ID of a plaintext event as its sender would compute it
    pub fn message_id_for(sender: &str, event: &Event) -> Result<String> {
        Ok(crypto::message_id(sender, &event.to_cbor()?))
    }

    /// Verify the sender signature
    ///
    /// # Errors
    /// `Error::Validation` if the sender key is malformed or the signature
    /// does not match
    pub fn verify(&self) -> Result<()> {
        if !self.is_version_compatible() {
            return Err(Error::Validation(format!("unsupported protocol version {}", self.version)));
        }
        let body_bytes =
            serde_cbor::to_vec(&self.body).map_err(|e| Error::CborSerialization(e.to_string()))?;
        if !crypto::verify_signature(&self.from, &body_bytes, &self.signature)? {
            return Err(Error::Validation(format!("bad signature from {}", self.from)));
        }
        Ok(())
    }

    /// Verify and decode the envelope
    pub fn open(&self, ratchet: &dyn HashRatchet) -> Result<Opened> {
        self.verify()?;

        let payload = match &self.body {
            Body::Plain(payload) => payload.clone(),
            Body::Group(ciphertext) => match ratchet.decrypt(ciphertext)? {
                Some(payload) => payload,
                None => {
                    return Ok(Opened::MissingKey {
                        group_id: ciphertext.group_id.clone(),
                        key_id: ciphertext.key_id,
                    });
                }
            },
        };

        Ok(Opened::Event(Decoded {
            event: Event::from_cbor(&payload)?,
            sender: self.from.clone(),
            message_id: crypto::message_id(&self.from, &payload),
        }))
    }

    /// Check if the envelope has a supported version
    pub fn is_version_compatible(&self) -> bool {
        self.version <= PROTOCOL_VERSION
    }

    /// Encode the envelope to CBOR format
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        serde_cbor::to_vec(self).map_err(|e| Error::CborSerialization(e.to_string()))
    }

    /// Decode an envelope from CBOR format
    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        serde_cbor::from_slice(data)
            .map_err(|e| Error::Validation(format!("malformed envelope: {}", e)))
    }

    /// Encode to JSON string (pretty-printed), for debugging
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Error::JsonSerialization)
    }
}

/// Broadcast topic for a chat
pub fn chat_topic(chat_id: &str) -> String {
    format!("chat/{}", chat_id)
}

/// Broadcast topic for contact-level events addressed to `public_key`
pub fn contact_topic(public_key: &str) -> String {
    format!("contact/{}", public_key)
}

/// Broadcast topic shared by the devices of one identity
pub fn sync_topic(public_key: &str) -> String {
    format!("sync/{}", public_key)
}

/// Broadcast topic for key exchanges of a hash-ratchet group
pub fn key_exchange_topic(group_id: &str) -> String {
    format!("keys/{}", group_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keyring;

    fn text_event(text: &str) -> Event {
        Event::ChatMessage(ChatMessage {
            chat_id: "status".to_string(),
            chat_type: ChatType::Public,
            clock: 10,
            timestamp: 10,
            text: text.to_string(),
            response_to: None,
            contact_state: None,
        })
    }

    #[test]
    fn test_seal_and_open_plain_event() {
        let sender = KeyPair::generate().expect("Failed to generate sender keypair");
        let keyring = Keyring::new();
        let event = text_event("hello");

        let envelope = Envelope::seal(&sender, &event).expect("Failed to seal");
        let bytes = envelope.to_cbor().expect("Failed to encode");
        let decoded = Envelope::from_cbor(&bytes).expect("Failed to decode");

        match decoded.open(&keyring).expect("Failed to open") {
            Opened::Event(decoded) => {
                assert_eq!(decoded.event, event);
                assert_eq!(decoded.sender, sender.public_key_hex());
                assert_eq!(
                    decoded.message_id,
                    Envelope::message_id_for(&sender.public_key_hex(), &event).unwrap()
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_tampered_envelope_is_rejected() {
        let sender = KeyPair::generate().expect("Failed to generate sender keypair");
        let keyring = Keyring::new();

        let mut envelope = Envelope::seal(&sender, &text_event("hello")).unwrap();
        envelope.body = Body::Plain(text_event("forged").to_cbor().unwrap());

        let err = envelope.open(&keyring).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_forged_sender_is_rejected() {
        let sender = KeyPair::generate().unwrap();
        let other = KeyPair::generate().unwrap();
        let keyring = Keyring::new();

        let mut envelope = Envelope::seal(&sender, &text_event("hello")).unwrap();
        envelope.from = other.public_key_hex();

        assert!(envelope.verify().is_err());
        assert!(envelope.open(&keyring).is_err());
    }

    #[test]
    fn test_group_payload_waits_for_key() {
        let sender = KeyPair::generate().unwrap();
        let owner_keys = Keyring::new();
        let reader_keys = Keyring::new();
        let key = owner_keys.rekey("community", 1).unwrap();

        let envelope =
            Envelope::seal_for_group(&sender, &text_event("secret"), &owner_keys, "community")
                .unwrap();

        assert_eq!(
            envelope.open(&reader_keys).unwrap(),
            Opened::MissingKey {
                group_id: "community".to_string(),
                key_id: key.key_id
            }
        );

        reader_keys.install_key(key).unwrap();
        assert!(matches!(envelope.open(&reader_keys).unwrap(), Opened::Event(_)));
    }

    #[test]
    fn test_version_compatibility() {
        let sender = KeyPair::generate().unwrap();
        let mut envelope = Envelope::seal(&sender, &text_event("v")).unwrap();
        assert!(envelope.is_version_compatible());

        envelope.version = PROTOCOL_VERSION + 1;
        assert!(!envelope.is_version_compatible());
        assert!(matches!(envelope.verify(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_malformed_bytes_are_validation_errors() {
        assert!(matches!(Envelope::from_cbor(b"not cbor"), Err(Error::Validation(_))));
        assert!(matches!(Event::from_cbor(&[0xff, 0x00]), Err(Error::Validation(_))));
    }

    #[test]
    fn test_json_debug_encoding() {
        let sender = KeyPair::generate().unwrap();
        let envelope = Envelope::seal(&sender, &text_event("json")).unwrap();
        let json = envelope.to_json_string().expect("Failed to encode to JSON string");
        assert!(json.contains("version"));
        assert!(json.contains("signature"));
    }
}
