//! Cryptographic operations module
//!
//! This module wraps the primitives the reconciliation core consumes:
//! - Identity key pairs, signatures and public-key validation
//! - Content-derived message and notification IDs
//! - Group-key storage and group payload encryption (`HashRatchet`)
//!
//! Key exchange itself (bundle exchange, ratchet derivation) lives outside
//! this crate; `HashRatchet` is the seam where it plugs in.

use crate::{clock::MergeOutcome, Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use ring::digest::{Context, SHA256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Length of an encoded public key: `0x` followed by 64 hex characters
pub const PUBLIC_KEY_HEX_LEN: usize = 66;

/// Encode raw public key bytes as `0x`-prefixed hex
pub fn public_key_to_hex(public_key: &[u8]) -> String {
    format!("0x{}", hex::encode(public_key))
}

/// Validate a `0x`-prefixed Ed25519 public key and return its raw bytes
///
/// # Errors
/// Returns `Error::Validation` if the prefix, length, hex digits or curve
/// point are invalid
pub fn validate_public_key(public_key_hex: &str) -> Result<[u8; 32]> {
    let digits = public_key_hex
        .strip_prefix("0x")
        .ok_or_else(|| {
            Error::Validation(format!("public key must start with 0x: {}", public_key_hex))
        })?;

    let bytes = hex::decode(digits)
        .map_err(|e| Error::Validation(format!("public key is not hex: {}", e)))?;

    let array: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        Error::Validation(format!(
            "public key must be 32 bytes, got {}",
            bytes.len()
        ))
    })?;

    VerifyingKey::from_bytes(&array)
        .map_err(|e| Error::Validation(format!("public key is not a curve point: {}", e)))?;

    Ok(array)
}

/// Verify a detached Ed25519 signature made by `public_key_hex`
pub fn verify_signature(public_key_hex: &str, message: &[u8], signature: &[u8]) -> Result<bool> {
    let key_bytes = validate_public_key(public_key_hex)?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| Error::Crypto(format!("Invalid public key: {}", e)))?;

    let signature = Signature::from_bytes(
        signature
            .try_into()
            .map_err(|_| Error::Crypto("Invalid signature length".to_string()))?,
    );

    Ok(verifying_key.verify(message, &signature).is_ok())
}

/// SHA-256 over the concatenation of `parts`
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut context = Context::new(&SHA256);
    for part in parts {
        context.update(part);
    }
    let digest = context.finish();
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

/// Content-derived message ID: hash of the signer and the signed payload
pub fn message_id(signer_hex: &str, payload: &[u8]) -> String {
    format!("0x{}", hex::encode(sha256(&[signer_hex.as_bytes(), payload])))
}

/// Stable notification ID so re-delivery recomputes the same record
pub fn notification_id(kind: &str, key: &str) -> String {
    hex::encode(sha256(&[kind.as_bytes(), b":", key.as_bytes()]))
}

/// Ed25519 identity key pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPair {
    /// Ed25519 public key (for verification)
    pub public_key: Vec<u8>,
    /// Ed25519 private key (should be kept secure)
    pub(crate) private_key: Vec<u8>,
}

impl KeyPair {
    /// Generate a new key pair
    pub fn generate() -> Result<Self> {
        use rand::rngs::OsRng;

        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        Ok(KeyPair {
            public_key: verifying_key.to_bytes().to_vec(),
            private_key: signing_key.to_bytes().to_vec(),
        })
    }

    /// Rebuild a key pair from stored private key bytes
    pub fn from_private_key(private_key: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = private_key
            .try_into()
            .map_err(|_| Error::Crypto("Invalid private key length".to_string()))?;
        let signing_key = SigningKey::from_bytes(&bytes);

        Ok(KeyPair {
            public_key: signing_key.verifying_key().to_bytes().to_vec(),
            private_key: bytes.to_vec(),
        })
    }

    /// `0x`-prefixed hex of the public key; this is the identity used as
    /// contact ID and one-to-one chat ID
    pub fn public_key_hex(&self) -> String {
        public_key_to_hex(&self.public_key)
    }

    /// Sign a message with the private key
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signing_key = SigningKey::from_bytes(
            self.private_key
                .as_slice()
                .try_into()
                .map_err(|_| Error::Crypto("Invalid private key length".to_string()))?,
        );

        let signature = signing_key.sign(message);
        Ok(signature.to_bytes().to_vec())
    }

    /// Verify a signature with this key pair's public key
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool> {
        verify_signature(&self.public_key_hex(), message, signature)
    }
}

/// Encrypted payload: XChaCha20-Poly1305 nonce and ciphertext with tag
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    /// 24-byte nonce for XChaCha20-Poly1305
    pub nonce: [u8; 24],
    /// Encrypted data + 16-byte Poly1305 authentication tag (appended)
    pub ciphertext: Vec<u8>,
}

/// Encrypt a payload using XChaCha20-Poly1305 AEAD
pub fn encrypt_message(secret: &[u8; 32], plaintext: &[u8]) -> Result<EncryptedEnvelope> {
    use rand::RngCore;

    let cipher = XChaCha20Poly1305::new(secret.into());

    let mut nonce_bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    Ok(EncryptedEnvelope {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Decrypt a payload using XChaCha20-Poly1305 AEAD
pub fn decrypt_message(secret: &[u8; 32], envelope: &EncryptedEnvelope) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(secret.into());
    let nonce = XNonce::from(envelope.nonce);

    cipher
        .decrypt(&nonce, envelope.ciphertext.as_ref())
        .map_err(|e| {
            Error::Crypto(format!(
                "Decryption failed (auth tag mismatch or corrupted data): {}",
                e
            ))
        })
}

/// One generation of a hash-ratchet group secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKey {
    /// Hash-ratchet group (community ID, or community ID + channel ID)
    pub group_id: String,
    /// Generation of the key within the group, increasing on every rekey
    pub key_id: u32,
    /// Symmetric secret
    pub secret: [u8; 32],
    /// Wall time the key was generated at (ms)
    pub timestamp: u64,
}

/// Group payload sealed under a specific key generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCiphertext {
    /// Group the payload belongs to
    pub group_id: String,
    /// Key generation used for sealing
    pub key_id: u32,
    /// Sealed payload
    pub envelope: EncryptedEnvelope,
}

/// Group-key collaborator
///
/// Owns the symmetric secrets of every hash-ratchet group this identity is
/// part of and seals key material for distribution.
pub trait HashRatchet: Send + Sync {
    /// Generate a fresh key generation for `group_id` and make it current
    fn rekey(&self, group_id: &str, timestamp: u64) -> Result<GroupKey>;

    /// Current key generation for `group_id`, if any
    fn current_key(&self, group_id: &str) -> Result<Option<GroupKey>>;

    /// Install a key received from the control node
    fn install_key(&self, key: GroupKey) -> Result<MergeOutcome>;

    /// Seal key material for a recipient set
    fn seal_key(&self, key: &GroupKey, recipients: &[String]) -> Result<Vec<u8>>;

    /// Open key material sealed by `seal_key`
    fn open_key(&self, sealed: &[u8]) -> Result<GroupKey>;

    /// Encrypt a payload with the current key of `group_id`
    fn encrypt(&self, group_id: &str, plaintext: &[u8]) -> Result<GroupCiphertext>;

    /// Decrypt a group payload; `Ok(None)` when the key has not arrived yet
    fn decrypt(&self, ciphertext: &GroupCiphertext) -> Result<Option<Vec<u8>>>;
}

/// In-process `HashRatchet` keeping every key generation per group
///
/// Sealed key material is CBOR without per-recipient encryption; deployments
/// that need confidentiality of the key exchange plug a bundle-exchange
/// implementation in through the trait instead.
#[derive(Debug, Default)]
pub struct Keyring {
    groups: Mutex<HashMap<String, BTreeMap<u32, GroupKey>>>,
}

impl Keyring {
    /// Create an empty keyring
    pub fn new() -> Self {
        Self::default()
    }

    fn with_groups<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, BTreeMap<u32, GroupKey>>) -> R,
    ) -> Result<R> {
        let mut groups = self
            .groups
            .lock()
            .map_err(|_| Error::Crypto("keyring lock poisoned".to_string()))?;
        Ok(f(&mut groups))
    }
}

impl HashRatchet for Keyring {
    fn rekey(&self, group_id: &str, timestamp: u64) -> Result<GroupKey> {
        use rand::RngCore;

        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);

        self.with_groups(|groups| {
            let generations = groups.entry(group_id.to_string()).or_default();
            let key_id = generations.keys().next_back().map_or(1, |last| last + 1);
            let key = GroupKey {
                group_id: group_id.to_string(),
                key_id,
                secret,
                timestamp,
            };
            generations.insert(key_id, key.clone());
            key
        })
    }

    fn current_key(&self, group_id: &str) -> Result<Option<GroupKey>> {
        self.with_groups(|groups| {
            groups
                .get(group_id)
                .and_then(|generations| generations.values().next_back().cloned())
        })
    }

    fn install_key(&self, key: GroupKey) -> Result<MergeOutcome> {
        self.with_groups(|groups| {
            let generations = groups.entry(key.group_id.clone()).or_default();
            if generations.contains_key(&key.key_id) {
                return MergeOutcome::Stale;
            }
            generations.insert(key.key_id, key);
            MergeOutcome::Applied
        })
    }

    fn seal_key(&self, key: &GroupKey, _recipients: &[String]) -> Result<Vec<u8>> {
        serde_cbor::to_vec(key).map_err(|e| Error::CborSerialization(e.to_string()))
    }

    fn open_key(&self, sealed: &[u8]) -> Result<GroupKey> {
        serde_cbor::from_slice(sealed).map_err(|e| Error::CborSerialization(e.to_string()))
    }

    fn encrypt(&self, group_id: &str, plaintext: &[u8]) -> Result<GroupCiphertext> {
        let key = self
            .current_key(group_id)?
            .ok_or_else(|| Error::Crypto(format!("no key for group {}", group_id)))?;

        Ok(GroupCiphertext {
            group_id: group_id.to_string(),
            key_id: key.key_id,
            envelope: encrypt_message(&key.secret, plaintext)?,
        })
    }

    fn decrypt(&self, ciphertext: &GroupCiphertext) -> Result<Option<Vec<u8>>> {
        let key = self.with_groups(|groups| {
            groups
                .get(&ciphertext.group_id)
                .and_then(|generations| generations.get(&ciphertext.key_id).cloned())
        })?;

        match key {
            Some(key) => decrypt_message(&key.secret, &ciphertext.envelope).map(Some),
            None => Ok(None),
        }
    }
}
