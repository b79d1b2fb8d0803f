use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a federation node as seen by its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Inactive,
    Suspended,
}

/// Capabilities a node advertises during handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCapability {
    SignalSharing,
    Consensus,
    Relay,
    Correlation,
}

impl NodeCapability {
    pub fn all() -> Vec<NodeCapability> {
        vec![
            NodeCapability::SignalSharing,
            NodeCapability::Consensus,
            NodeCapability::Relay,
            NodeCapability::Correlation,
        ]
    }
}

/// Descriptor of a regional node, exchanged during handshake.
///
/// The identity fields (`id`, `region`, `public_key`, `capabilities`) never
/// change after creation. `status`, `trust_score` and `last_seen` are mutated
/// only by the owning node or by a consensus-approved update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationNode {
    pub id: String,
    pub region: String,
    /// Hex-encoded ed25519 verifying key.
    pub public_key: String,
    pub capabilities: Vec<NodeCapability>,
    /// Trust score in `[0, 1]`.
    pub trust_score: f64,
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
    /// Address the node accepts inbound links on, if it listens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl FederationNode {
    pub fn new<I: Into<String>, R: Into<String>, K: Into<String>>(
        id: I,
        region: R,
        public_key: K,
    ) -> Self {
        Self {
            id: id.into(),
            region: region.into(),
            public_key: public_key.into(),
            capabilities: NodeCapability::all(),
            trust_score: 1.0,
            status: NodeStatus::Active,
            last_seen: Utc::now(),
            endpoint: None,
        }
    }

    pub fn with_endpoint<E: Into<String>>(mut self, endpoint: E) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Set the trust score, clamped to `[0, 1]`.
    pub fn set_trust_score(&mut self, score: f64) {
        self.trust_score = if score.is_nan() {
            0.0
        } else {
            score.clamp(0.0, 1.0)
        };
    }

    pub fn has_capability(&self, capability: NodeCapability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_score_is_clamped() {
        let mut node = FederationNode::new("node-a", "eu-west", "00");
        node.set_trust_score(1.7);
        assert_eq!(node.trust_score, 1.0);
        node.set_trust_score(-0.2);
        assert_eq!(node.trust_score, 0.0);
        node.set_trust_score(f64::NAN);
        assert_eq!(node.trust_score, 0.0);
    }

    #[test]
    fn descriptor_uses_camel_case_on_the_wire() {
        let node = FederationNode::new("node-a", "eu-west", "abcd").with_endpoint("mem://9000");
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["publicKey"], "abcd");
        assert_eq!(json["trustScore"], 1.0);
        assert_eq!(json["status"], "active");
        assert_eq!(json["endpoint"], "mem://9000");
    }
}
