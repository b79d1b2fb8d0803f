use serde::{Deserialize, Serialize};

/// Point-in-time view of a node's connectivity, exposed for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkHealth {
    pub running: bool,
    pub connected_peers: usize,
    /// Links still waiting for a handshake.
    pub connecting_peers: usize,
    /// Identities learned from handshakes, including disconnected ones.
    pub known_nodes: usize,
    pub max_peers: usize,
    pub avg_latency_ms: f64,
}

impl NetworkHealth {
    /// Running with at least one authenticated peer.
    pub fn is_healthy(&self) -> bool {
        self.running && self.connected_peers > 0
    }

    /// Fraction of the peer budget in use.
    pub fn utilization(&self) -> f64 {
        if self.max_peers == 0 {
            return 1.0;
        }
        (self.connected_peers + self.connecting_peers) as f64 / self.max_peers as f64
    }
}
