//! Sentinel Network Core
//!
//! Transport abstraction, gossip propagation and peer discovery for the
//! federation layer.
//!
//! ## Modules
//! - `transport`: Link-layer contract any socket or in-process transport implements
//! - `memory`: In-process transport bound to an explicit `MemoryHub`
//! - `gossip`: Handshakes, heartbeats and TTL-bounded flooding
//! - `peers`: The node's single peer roster
//! - `deduplication`: Prevents duplicate message processing
//! - `events`: Publish/subscribe bus with cancellable subscriptions
//! - `discovery`: Discovered-peer table, backoff and peer exchange
//! - `discovery_service`: Refresh loop wiring discovery to the gossip network
//! - `routing`: XOR-distance routing tables
//! - `metrics`: Aggregates real-time network statistics
//! - `health`: Connectivity summary for monitoring

pub mod deduplication;
pub mod discovery;
pub mod discovery_service;
pub mod error;
pub mod events;
pub mod gossip;
pub mod health;
pub mod memory;
pub mod metrics;
pub mod peers;
pub mod routing;
pub mod transport;

// ------------------------------------------------------------
// Re-exports for workspace-wide use
// ------------------------------------------------------------

// Transport
pub use error::{NetworkError, Result, TransportError};
pub use memory::{MemoryHub, MemoryTransport};
pub use transport::{Transport, TransportEvent};

// Gossip & messaging
pub use deduplication::MessageDeduplicator;
pub use events::{EventBus, Subscription};
pub use gossip::{GossipNetwork, NetworkConfig, NetworkEvent};
pub use peers::{ConnectionState, PeerConnection, PeerTable};

// Discovery & routing
pub use discovery::{
    BootstrapPeer, DiscoveredNodeInfo, DiscoveredPeer, DiscoveryConfig, DiscoverySource,
    DiscoveryStats, PeerDiscovery, RoutingStrategy,
};
pub use discovery_service::DiscoveryService;
pub use routing::{
    HashPrefixRoutingTable, KademliaRoutingTable, RoutingEntry, RoutingTable,
};

// Metrics & health
pub use health::NetworkHealth;
pub use metrics::{NetworkMetrics, NetworkMetricsSnapshot};
