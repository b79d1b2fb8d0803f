use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Kind of cross-node action a proposal asks the federation to agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    /// Coordinated intervention against a cross-region threat.
    ThreatEscalation,
    /// Suspend a misbehaving node. `data` carries `{"nodeId": ...}`.
    NodeSuspension,
    /// Set a node's trust score. `data` carries `{"nodeId": ..., "trustScore": ...}`.
    TrustAdjustment,
    PolicyChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ProposalStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, ProposalStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Approve,
    Reject,
}

/// A proposal and every vote this node has observed for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusProposal {
    pub id: String,
    #[serde(rename = "type")]
    pub proposal_type: ProposalType,
    pub data: Value,
    pub proposer_id: String,
    pub votes: HashMap<String, VoteChoice>,
    pub created_at: DateTime<Utc>,
    pub status: ProposalStatus,
}

impl ConsensusProposal {
    /// New pending proposal carrying the proposer's implicit approval.
    pub fn new<P: Into<String>>(proposal_type: ProposalType, data: Value, proposer_id: P) -> Self {
        let proposer_id = proposer_id.into();
        let mut votes = HashMap::new();
        votes.insert(proposer_id.clone(), VoteChoice::Approve);
        Self {
            id: Uuid::new_v4().to_string(),
            proposal_type,
            data,
            proposer_id,
            votes,
            created_at: Utc::now(),
            status: ProposalStatus::Pending,
        }
    }

    pub fn approve_count(&self) -> usize {
        self.votes
            .values()
            .filter(|vote| **vote == VoteChoice::Approve)
            .count()
    }

    pub fn reject_count(&self) -> usize {
        self.votes
            .values()
            .filter(|vote| **vote == VoteChoice::Reject)
            .count()
    }

    pub fn is_pending(&self) -> bool {
        self.status == ProposalStatus::Pending
    }
}

/// `data` of a [`ProposalType::NodeSuspension`] proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSuspensionData {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `data` of a [`ProposalType::TrustAdjustment`] proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustAdjustmentData {
    pub node_id: String,
    pub trust_score: f64,
}
