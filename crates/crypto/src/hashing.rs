//! SHA-256 helpers shared by routing, anonymization and commitment proofs.

use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result[..]);
    hash
}

/// Lowercase hex SHA-256 digest of `data`.
pub fn sha256_hex<T: AsRef<[u8]>>(data: T) -> String {
    hex::encode(sha256(data.as_ref()))
}

/// `hash(hash(salt ++ value))`, hex encoded.
///
/// Two parties holding the same value and salt derive the same digest, so they
/// can compare observables without exchanging them.
pub fn double_hash(value: &str, salt: &str) -> String {
    let inner = sha256_hex(format!("{salt}{value}"));
    sha256_hex(inner)
}

/// Cryptographic utilities
pub struct CryptoUtils;

impl CryptoUtils {
    /// Generate a random 32-byte nonce
    pub fn random_nonce() -> [u8; 32] {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    /// Random hex salt for commitments
    pub fn random_salt() -> String {
        hex::encode(Self::random_nonce())
    }
}
