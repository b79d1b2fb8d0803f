//! Salted hash commitment to "value exceeds threshold".
//!
//! The prover commits to a value and publishes whether it exceeds a
//! threshold, together with hashes binding that claim to the commitment and
//! the threshold. Anyone holding the salt can check the claim is consistent
//! with what was committed. This is a demonstration scheme: it does not hide
//! the value from a party that can enumerate candidates, and it is not a
//! zero-knowledge proof.

use sentinel_crypto::sha256_hex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdProof {
    /// `hash(value:salt)`
    pub commitment: String,
    /// `hash(exceeds:commitment:salt)`
    pub proof: String,
    /// `hash("vk":threshold:salt)`
    pub verification_key: String,
    pub exceeds: bool,
}

fn proof_hash(exceeds: bool, commitment: &str, salt: &str) -> String {
    sha256_hex(format!("{exceeds}:{commitment}:{salt}"))
}

fn verification_key(threshold: f64, salt: &str) -> String {
    sha256_hex(format!("vk:{threshold}:{salt}"))
}

/// Commit to `value` and state whether it exceeds `threshold`.
pub fn prove_threshold_exceeded(value: f64, threshold: f64, salt: &str) -> ThresholdProof {
    let exceeds = value > threshold;
    let commitment = sha256_hex(format!("{value}:{salt}"));
    ThresholdProof {
        proof: proof_hash(exceeds, &commitment, salt),
        verification_key: verification_key(threshold, salt),
        commitment,
        exceeds,
    }
}

/// Check that `proof` was produced for `threshold` and `salt` with the
/// outcome `claimed`.
pub fn verify_threshold_proof(
    proof: &ThresholdProof,
    threshold: f64,
    salt: &str,
    claimed: bool,
) -> bool {
    proof.exceeds == claimed
        && proof.proof == proof_hash(claimed, &proof.commitment, salt)
        && proof.verification_key == verification_key(threshold, salt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_crypto::CryptoUtils;

    #[test]
    fn genuine_proof_verifies() {
        let salt = CryptoUtils::random_salt();
        let proof = prove_threshold_exceeded(42.0, 10.0, &salt);
        assert!(proof.exceeds);
        assert!(verify_threshold_proof(&proof, 10.0, &salt, true));

        let below = prove_threshold_exceeded(3.0, 10.0, &salt);
        assert!(!below.exceeds);
        assert!(verify_threshold_proof(&below, 10.0, &salt, false));
    }

    #[test]
    fn changing_threshold_salt_or_result_fails() {
        let proof = prove_threshold_exceeded(42.0, 10.0, "salt-a");
        assert!(!verify_threshold_proof(&proof, 11.0, "salt-a", true));
        assert!(!verify_threshold_proof(&proof, 10.0, "salt-b", true));
        assert!(!verify_threshold_proof(&proof, 10.0, "salt-a", false));
    }

    #[test]
    fn flipped_claim_inside_proof_fails() {
        let mut proof = prove_threshold_exceeded(42.0, 10.0, "salt-a");
        proof.exceeds = false;
        assert!(!verify_threshold_proof(&proof, 10.0, "salt-a", false));
    }

    #[test]
    fn commitment_depends_on_salt() {
        let proof = prove_threshold_exceeded(1234.5, 10.0, "salt-a");
        assert_eq!(proof.commitment.len(), 64);
        assert_ne!(
            proof.commitment,
            prove_threshold_exceeded(1234.5, 10.0, "salt-b").commitment
        );
    }
}
