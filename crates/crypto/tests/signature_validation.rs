use ed25519_dalek::{Signer, SigningKey, Verifier};
use sentinel_crypto::{verify_hex, verify_message_signature, KeyPair, NodeIdentity};
use sentinel_types::{MessageType, BROADCAST};
use serde_json::json;

const DETERMINISTIC_SEED: [u8; 32] = [42u8; 32];

#[test]
fn ed25519_signature_roundtrip_succeeds() {
    let key_pair = KeyPair::generate();
    let message = b"sentinel::crypto::signature::roundtrip";

    let signature = key_pair.sign(message);
    assert!(key_pair.verify(message, &signature).is_ok());
    assert!(verify_hex(&key_pair.public_key_hex(), message, &key_pair.sign_hex(message)).is_ok());
}

#[test]
fn ed25519_signature_rejects_tampered_signature() {
    let key_pair = KeyPair::generate();
    let message = b"sentinel::crypto::signature::tamper-check";

    let mut signature = key_pair.sign(message);
    signature[0] ^= 0xFF;

    assert!(key_pair.verify(message, &signature).is_err());
    assert!(verify_hex(&key_pair.public_key_hex(), message, "not-hex").is_err());
}

#[test]
fn deterministic_keypair_matches_dalek() {
    let key_pair = KeyPair::from_secret_bytes(&DETERMINISTIC_SEED);
    let signing_key = SigningKey::from_bytes(&DETERMINISTIC_SEED);
    assert_eq!(key_pair.public_key(), signing_key.verifying_key().to_bytes());

    let message = b"sentinel::crypto::deterministic-keypair";
    let ours = key_pair.sign(message);
    let theirs = signing_key.sign(message);
    assert_eq!(ours, theirs.to_bytes());
    assert!(signing_key.verifying_key().verify(message, &theirs).is_ok());

    let alternative = KeyPair::from_secret_bytes(&[7u8; 32]);
    assert_ne!(key_pair.public_key(), alternative.public_key());
}

#[test]
fn relayed_envelopes_keep_a_valid_signature() {
    let identity = NodeIdentity::new(
        "node-eu",
        "eu-west",
        KeyPair::from_secret_bytes(&DETERMINISTIC_SEED),
    );
    let message = identity.create_message(
        MessageType::ThreatSignal,
        json!({"signalType": "grooming"}),
        BROADCAST,
    );
    let relayed = message.relayed().expect("fresh broadcast can be relayed");

    assert!(relayed.ttl() < message.ttl());
    assert!(verify_message_signature(&relayed, &identity.public_key_hex()));
    assert_eq!(identity.descriptor().public_key, identity.public_key_hex());
}
