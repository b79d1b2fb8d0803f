use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::node::{FederationNode, NodeStatus};
use crate::proposal::VoteChoice;

/// Recipient id addressing every reachable node through gossip.
pub const BROADCAST: &str = "broadcast";

/// Hop budget for freshly created broadcast messages.
pub const DEFAULT_TTL: u32 = 5;

/// Message types carried by the federation envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Handshake,
    Heartbeat,
    PeerExchange,
    ThreatSignal,
    ConsensusProposal,
    ConsensusVote,
    NodeUpdate,
}

impl MessageType {
    /// Link-level messages are consumed by the transport layer and never
    /// deduplicated, relayed or dispatched to application handlers.
    pub fn is_link_control(&self) -> bool {
        matches!(self, MessageType::Handshake | MessageType::Heartbeat)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Handshake => "handshake",
            MessageType::Heartbeat => "heartbeat",
            MessageType::PeerExchange => "peer_exchange",
            MessageType::ThreatSignal => "threat_signal",
            MessageType::ConsensusProposal => "consensus_proposal",
            MessageType::ConsensusVote => "consensus_vote",
            MessageType::NodeUpdate => "node_update",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed message envelope.
///
/// Immutable once signed, except for `ttl` which every gossip relay
/// decrements and which is therefore not covered by the signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender_id: String,
    pub recipient_id: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningView<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    message_type: MessageType,
    sender_id: &'a str,
    recipient_id: &'a str,
    payload: &'a Value,
    timestamp: &'a DateTime<Utc>,
}

impl Message {
    /// Build an unsigned envelope with a fresh id and the current timestamp.
    pub fn unsigned<S: Into<String>, R: Into<String>>(
        message_type: MessageType,
        sender_id: S,
        recipient_id: R,
        payload: Value,
    ) -> Self {
        let recipient_id = recipient_id.into();
        let ttl = (recipient_id == BROADCAST).then_some(DEFAULT_TTL);
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            sender_id: sender_id.into(),
            recipient_id,
            payload,
            timestamp: Utc::now(),
            signature: String::new(),
            ttl,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id == BROADCAST
    }

    pub fn ttl(&self) -> u32 {
        self.ttl.unwrap_or(0)
    }

    /// Canonical bytes covered by the signature: every field except
    /// `signature` and `ttl`, in declaration order.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let view = SigningView {
            id: &self.id,
            message_type: self.message_type,
            sender_id: &self.sender_id,
            recipient_id: &self.recipient_id,
            payload: &self.payload,
            timestamp: &self.timestamp,
        };
        // Serializing borrowed strings and a `Value` into a Vec cannot fail.
        serde_json::to_vec(&view).unwrap_or_default()
    }

    /// Copy of this message with the hop budget reduced by one, or `None`
    /// once the budget is spent.
    pub fn relayed(&self) -> Option<Message> {
        let ttl = self.ttl();
        if ttl == 0 {
            return None;
        }
        let mut next = self.clone();
        next.ttl = Some(ttl - 1);
        Some(next)
    }

    pub fn decode_payload<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// First message on every link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    pub node: FederationNode,
    /// Sender clock in milliseconds, used for the latency estimate.
    pub sent_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub sent_at_ms: i64,
}

/// Entry shared during peer exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub address: String,
    pub node_id: String,
    pub region: String,
    pub trust_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerExchangePayload {
    pub peers: Vec<PeerSummary>,
    /// Ask the receiver to answer with its own peer list.
    pub request_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotePayload {
    pub proposal_id: String,
    pub vote: VoteChoice,
}

/// Status announcement by the owning node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdatePayload {
    pub node_id: String,
    pub status: NodeStatus,
}
