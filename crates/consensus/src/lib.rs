//! Federation consensus core.
//!
//! Verifies and dispatches signed federation messages, tracks proposals and
//! votes, and applies consensus-approved changes to the network's roster.
//! Membership comes from the gossip network; this crate keeps no peer list of
//! its own.

pub mod engine;
pub mod handlers;
pub mod proposals;

use sentinel_network::NetworkError;

pub use engine::{ConsensusConfig, ConsensusEvent, FederationCore};
pub use handlers::{HandlerId, HandlerRegistry, MessageHandler};
pub use proposals::{evaluate, ProposalBook, VoteOutcome};

/// Consensus errors
#[derive(thiserror::Error, Debug)]
pub enum ConsensusError {
    #[error("Unknown proposal: {0}")]
    UnknownProposal(String),
    #[error("Already voted on proposal {0}")]
    AlreadyVoted(String),
    #[error("Consensus threshold must lie in (0, 1], got {0}")]
    InvalidThreshold(f64),
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
