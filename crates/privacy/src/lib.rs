//! Privacy-preserving threat-signal sharing.
//!
//! Turns a local [`ThreatSignal`](sentinel_types::ThreatSignal) into a
//! [`SharedSignal`](sentinel_types::SharedSignal) that can be gossiped:
//! identifying indicator types are dropped, indicator values and the signal id
//! are double hashed, and counts and confidences are perturbed with the
//! Laplace mechanism. Peers correlate shared signals against their own raw
//! indicators by re-hashing them, without either side disclosing raw values.
//!
//! The threshold proof in [`proof`] is a salted hash commitment for
//! demonstration. It is not a zero-knowledge proof and gives no soundness
//! guarantee.

pub mod aggregate;
pub mod anonymize;
pub mod differential;
pub mod proof;
pub mod sharing;

pub use aggregate::{AggregateSummary, SignalAggregator};
pub use anonymize::{IndicatorAnonymizer, SHAREABLE_INDICATORS};
pub use differential::DifferentialPrivacy;
pub use proof::{prove_threshold_exceeded, verify_threshold_proof, ThresholdProof};
pub use sharing::{MatchResult, SharingConfig, SignalSharing};

/// Privacy configuration errors
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PrivacyError {
    #[error("Privacy budget epsilon must be positive and finite, got {0}")]
    InvalidEpsilon(f64),
    #[error("Minimum sharing confidence must lie in [0, 1], got {0}")]
    InvalidMinConfidence(f64),
}

pub type Result<T> = std::result::Result<T, PrivacyError>;
