//! One federation node, assembled.
//!
//! [`FederationRuntime`] wires a gossip network, peer discovery, the consensus
//! core and privacy-preserving signal sharing over a single transport, and
//! correlates signals received from peers against a local watchlist.

pub mod config;
pub mod runtime;

pub use config::FederationConfig;
pub use runtime::{FederationEvent, FederationRuntime, FederationStatus};

use sentinel_consensus::ConsensusError;
use sentinel_network::NetworkError;
use sentinel_privacy::PrivacyError;

/// Federation runtime errors
#[derive(thiserror::Error, Debug)]
pub enum FederationError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),
    #[error("Privacy error: {0}")]
    Privacy(#[from] PrivacyError),
}

pub type Result<T> = std::result::Result<T, FederationError>;
