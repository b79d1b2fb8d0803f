//! Transport contract the gossip layer runs on.
//!
//! A transport moves opaque byte frames between links. It knows nothing about
//! node identities; the gossip layer learns those from the handshake.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Inbound notifications from a transport, delivered in order on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A remote opened a link to us.
    Connection { peer_id: String },
    /// A frame arrived on a link.
    Message { peer_id: String, data: Vec<u8> },
    /// The remote closed a link.
    Disconnect { peer_id: String },
}

/// Interchangeable link layer: in-process, TCP or WebSocket.
///
/// `peer_id` values are transport-level link identifiers and are only
/// meaningful to the transport that issued them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start accepting inbound links on `port`.
    async fn listen(&self, port: u16) -> Result<(), TransportError>;

    /// Open a link to `address`, returning the link id.
    async fn connect(&self, address: &str, timeout: Duration) -> Result<String, TransportError>;

    /// Send one frame over a link.
    async fn send(&self, peer_id: &str, data: Vec<u8>) -> Result<(), TransportError>;

    /// Close one link. The remote receives a `Disconnect` event.
    async fn disconnect(&self, peer_id: &str) -> Result<(), TransportError>;

    /// Close every link and stop listening. Later calls fail with `Closed`.
    async fn close(&self) -> Result<(), TransportError>;

    /// Address other nodes use to reach this transport, once listening.
    fn local_address(&self) -> Option<String>;

    /// Hand out the inbound event stream. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}
