//! Proposal bookkeeping and the threshold rule.

use chrono::{DateTime, Utc};
use sentinel_types::{ConsensusProposal, ProposalStatus, VoteChoice};
use std::collections::HashMap;
use std::time::Duration;

/// Slack for comparing vote fractions against the threshold, so that exactly
/// two of three nodes meet a 2/3 threshold despite rounding.
const FRACTION_EPSILON: f64 = 1e-9;

/// Outcome of a vote for `total` known nodes.
///
/// Approved once `approve / total >= threshold`, rejected once
/// `reject / total > 1 - threshold`, otherwise still pending.
pub fn evaluate(approve: usize, reject: usize, total: usize, threshold: f64) -> ProposalStatus {
    if total == 0 {
        return ProposalStatus::Pending;
    }
    let total = total as f64;
    if approve as f64 / total >= threshold - FRACTION_EPSILON {
        ProposalStatus::Approved
    } else if reject as f64 / total > 1.0 - threshold + FRACTION_EPSILON {
        ProposalStatus::Rejected
    } else {
        ProposalStatus::Pending
    }
}

/// Result of trying to record a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Recorded,
    UnknownProposal,
    NotPending(ProposalStatus),
    AlreadyVoted,
}

/// Every proposal this node has seen, keyed by id.
#[derive(Debug, Default)]
pub struct ProposalBook {
    proposals: HashMap<String, ConsensusProposal>,
}

impl ProposalBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a proposal. Returns false if the id is already known.
    pub fn insert(&mut self, proposal: ConsensusProposal) -> bool {
        if self.proposals.contains_key(&proposal.id) {
            return false;
        }
        self.proposals.insert(proposal.id.clone(), proposal);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<ConsensusProposal> {
        self.proposals.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&ConsensusProposal> {
        self.proposals.get(id)
    }

    pub fn all(&self) -> impl Iterator<Item = &ConsensusProposal> {
        self.proposals.values()
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    /// Move a pending proposal older than `timeout` to `Expired`.
    pub fn expire_if_stale(&mut self, id: &str, now: DateTime<Utc>, timeout: Duration) -> bool {
        match self.proposals.get_mut(id) {
            Some(proposal) if proposal.is_pending() && is_stale(proposal, now, timeout) => {
                proposal.status = ProposalStatus::Expired;
                true
            }
            _ => false,
        }
    }

    /// Expire every stale pending proposal, returning their ids.
    pub fn expire_stale(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .proposals
            .values()
            .filter(|p| p.is_pending() && is_stale(p, now, timeout))
            .map(|p| p.id.clone())
            .collect();
        for id in &stale {
            if let Some(proposal) = self.proposals.get_mut(id) {
                proposal.status = ProposalStatus::Expired;
            }
        }
        stale
    }

    pub fn record_vote(
        &mut self,
        id: &str,
        voter_id: &str,
        vote: VoteChoice,
        allow_revote: bool,
    ) -> VoteOutcome {
        let Some(proposal) = self.proposals.get_mut(id) else {
            return VoteOutcome::UnknownProposal;
        };
        if !proposal.is_pending() {
            return VoteOutcome::NotPending(proposal.status);
        }
        if !allow_revote && proposal.votes.contains_key(voter_id) {
            return VoteOutcome::AlreadyVoted;
        }
        proposal.votes.insert(voter_id.to_string(), vote);
        VoteOutcome::Recorded
    }

    /// Apply the threshold rule to a pending proposal. Returns the new status
    /// when it changed.
    pub fn evaluate(&mut self, id: &str, total: usize, threshold: f64) -> Option<ProposalStatus> {
        let proposal = self.proposals.get_mut(id)?;
        if !proposal.is_pending() {
            return None;
        }
        let status = evaluate(
            proposal.approve_count(),
            proposal.reject_count(),
            total,
            threshold,
        );
        if status == ProposalStatus::Pending {
            return None;
        }
        proposal.status = status;
        Some(status)
    }
}

fn is_stale(proposal: &ConsensusProposal, now: DateTime<Utc>, timeout: Duration) -> bool {
    match chrono::Duration::from_std(timeout) {
        Ok(timeout) => now - proposal.created_at > timeout,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sentinel_types::ProposalType;
    use serde_json::json;

    const TWO_THIRDS: f64 = 2.0 / 3.0;

    fn proposal() -> ConsensusProposal {
        ConsensusProposal::new(ProposalType::ThreatEscalation, json!({}), "node-a")
    }

    #[test]
    fn three_node_threshold_arithmetic() {
        assert_eq!(evaluate(1, 0, 3, TWO_THIRDS), ProposalStatus::Pending);
        assert_eq!(evaluate(2, 0, 3, TWO_THIRDS), ProposalStatus::Approved);
        assert_eq!(evaluate(1, 1, 3, TWO_THIRDS), ProposalStatus::Pending);
        assert_eq!(evaluate(1, 2, 3, TWO_THIRDS), ProposalStatus::Rejected);
    }

    #[test]
    fn single_node_approves_its_own_proposal() {
        assert_eq!(evaluate(1, 0, 1, TWO_THIRDS), ProposalStatus::Approved);
        assert_eq!(evaluate(0, 0, 0, TWO_THIRDS), ProposalStatus::Pending);
    }

    #[test]
    fn revotes_overwrite_when_allowed() {
        let mut book = ProposalBook::new();
        let p = proposal();
        let id = p.id.clone();
        book.insert(p);

        assert_eq!(
            book.record_vote(&id, "node-b", VoteChoice::Reject, true),
            VoteOutcome::Recorded
        );
        assert_eq!(
            book.record_vote(&id, "node-b", VoteChoice::Approve, true),
            VoteOutcome::Recorded
        );
        let stored = book.get(&id).unwrap();
        assert_eq!(stored.approve_count(), 2);
        assert_eq!(stored.reject_count(), 0);
    }

    #[test]
    fn revotes_refused_when_disallowed() {
        let mut book = ProposalBook::new();
        let p = proposal();
        let id = p.id.clone();
        book.insert(p);

        book.record_vote(&id, "node-b", VoteChoice::Reject, false);
        assert_eq!(
            book.record_vote(&id, "node-b", VoteChoice::Approve, false),
            VoteOutcome::AlreadyVoted
        );
        assert_eq!(book.get(&id).unwrap().reject_count(), 1);
    }

    #[test]
    fn finalized_proposals_ignore_votes() {
        let mut book = ProposalBook::new();
        let p = proposal();
        let id = p.id.clone();
        book.insert(p);
        book.record_vote(&id, "node-b", VoteChoice::Approve, true);

        assert_eq!(book.evaluate(&id, 3, TWO_THIRDS), Some(ProposalStatus::Approved));
        assert_eq!(book.evaluate(&id, 3, TWO_THIRDS), None);
        assert_eq!(
            book.record_vote(&id, "node-c", VoteChoice::Reject, true),
            VoteOutcome::NotPending(ProposalStatus::Approved)
        );
        assert_eq!(
            book.record_vote("missing", "node-c", VoteChoice::Reject, true),
            VoteOutcome::UnknownProposal
        );
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut book = ProposalBook::new();
        let p = proposal();
        assert!(book.insert(p.clone()));
        assert!(!book.insert(p));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn stale_pending_proposals_expire() {
        let mut book = ProposalBook::new();
        let mut old = proposal();
        old.created_at = Utc::now() - chrono::Duration::seconds(120);
        let old_id = old.id.clone();
        let fresh = proposal();
        let fresh_id = fresh.id.clone();
        book.insert(old);
        book.insert(fresh);

        let expired = book.expire_stale(Utc::now(), Duration::from_secs(30));
        assert_eq!(expired, vec![old_id.clone()]);
        assert_eq!(book.get(&old_id).unwrap().status, ProposalStatus::Expired);
        assert!(book.get(&fresh_id).unwrap().is_pending());
        assert!(!book.expire_if_stale(&old_id, Utc::now(), Duration::from_secs(30)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            max_global_rejects: 65536,
            ..ProptestConfig::default()
        })]
        #[test]
        fn approval_and_rejection_are_exclusive(
            total in 1usize..50,
            approve in 0usize..50,
            reject in 0usize..50,
            threshold in 0.5f64..1.0,
        ) {
            prop_assume!(approve + reject <= total);
            let status = evaluate(approve, reject, total, threshold);
            let approve_fraction = approve as f64 / total as f64;
            match status {
                ProposalStatus::Approved => {
                    prop_assert!(approve_fraction >= threshold - FRACTION_EPSILON)
                }
                ProposalStatus::Rejected => {
                    prop_assert!(approve_fraction < threshold - FRACTION_EPSILON)
                }
                ProposalStatus::Pending => {}
                ProposalStatus::Expired => prop_assert!(false, "evaluate never expires"),
            }
        }
    }
}
