// Crypto Tests - Testing identity keys, IDs and the keyring
use crate::crypto::*;
use crate::{Error, MergeOutcome};

#[test]
fn test_keypair_generation() {
    let keypair = KeyPair::generate().expect("Failed to generate keypair");
    assert_eq!(keypair.public_key.len(), 32);
    assert_eq!(keypair.public_key_hex().len(), PUBLIC_KEY_HEX_LEN);
    assert!(keypair.public_key_hex().starts_with("0x"));
}

#[test]
fn test_keypair_from_private_key_roundtrip() {
    let keypair = KeyPair::generate().expect("Failed to generate keypair");
    let restored = KeyPair::from_private_key(&keypair.private_key)
        .expect("Failed to restore keypair");
    assert_eq!(restored.public_key, keypair.public_key);
}

#[test]
fn test_sign_and_verify() {
    let keypair = KeyPair::generate().expect("Failed to generate keypair");
    let signature = keypair.sign(b"hello").expect("Failed to sign");

    assert!(keypair.verify(b"hello", &signature).expect("Failed to verify"));
    assert!(!keypair.verify(b"tampered", &signature).expect("Failed to verify"));
}

#[test]
fn test_validate_public_key_rejects_malformed() {
    let keypair = KeyPair::generate().expect("Failed to generate keypair");
    let hex = keypair.public_key_hex();
    assert!(validate_public_key(&hex).is_ok());

    for bad in ["", "0x", "deadbeef", "0xzz", &hex[2..], &hex[..40]] {
        match validate_public_key(bad) {
            Err(Error::Validation(_)) => {}
            other => panic!("expected validation error for {:?}, got {:?}", bad, other),
        }
    }
}

#[test]
fn test_message_id_is_content_derived() {
    let a = message_id("0xaa", b"payload");
    let b = message_id("0xaa", b"payload");
    let c = message_id("0xbb", b"payload");
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn test_notification_id_is_stable() {
    assert_eq!(notification_id("mention", "m1"), notification_id("mention", "m1"));
    assert_ne!(notification_id("mention", "m1"), notification_id("reply", "m1"));
}

#[test]
fn test_keyring_rekey_increments_generation() {
    let keyring = Keyring::new();
    let first = keyring.rekey("group", 10).expect("Failed to rekey");
    let second = keyring.rekey("group", 20).expect("Failed to rekey");

    assert_eq!(first.key_id, 1);
    assert_eq!(second.key_id, 2);
    assert_eq!(
        keyring.current_key("group").expect("Failed to read key").map(|k| k.key_id),
        Some(2)
    );
}

#[test]
fn test_keyring_decrypt_without_key_returns_none() {
    let sender = Keyring::new();
    let receiver = Keyring::new();
    sender.rekey("group", 10).expect("Failed to rekey");

    let ciphertext = sender.encrypt("group", b"secret").expect("Failed to encrypt");
    assert_eq!(receiver.decrypt(&ciphertext).expect("Failed to decrypt"), None);
}

#[test]
fn test_keyring_install_then_decrypt() {
    let sender = Keyring::new();
    let receiver = Keyring::new();
    let key = sender.rekey("group", 10).expect("Failed to rekey");

    let sealed = sender.seal_key(&key, &[]).expect("Failed to seal key");
    let opened = receiver.open_key(&sealed).expect("Failed to open key");
    assert_eq!(
        receiver.install_key(opened.clone()).expect("Failed to install"),
        MergeOutcome::Applied
    );
    assert_eq!(receiver.install_key(opened).expect("Failed to install"), MergeOutcome::Stale);

    let ciphertext = sender.encrypt("group", b"secret").expect("Failed to encrypt");
    assert_eq!(
        receiver.decrypt(&ciphertext).expect("Failed to decrypt"),
        Some(b"secret".to_vec())
    );
}

#[test]
fn test_encrypt_without_key_fails() {
    let keyring = Keyring::new();
    assert!(matches!(keyring.encrypt("group", b"x"), Err(Error::Crypto(_))));
}
