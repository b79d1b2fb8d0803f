use thiserror::Error;

/// Errors raised by a [`crate::Transport`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("address already in use: {0}")]
    AddressInUse(String),
    #[error("no listener at {0}")]
    ConnectionRefused(String),
    #[error("connection to {0} timed out")]
    Timeout(String),
    #[error("unknown link: {0}")]
    UnknownPeer(String),
}

/// Errors surfaced to callers of the gossip network.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("network has not been started")]
    NotStarted,
    #[error("maximum peer count reached ({0})")]
    MaxPeersReached(usize),
    #[error("peer is not connected: {0}")]
    PeerNotConnected(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NetworkError>;
