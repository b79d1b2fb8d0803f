//! Message verification, dispatch and the proposal/vote lifecycle for one node.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use sentinel_crypto::verify_message_signature;
use sentinel_network::{EventBus, GossipNetwork, NetworkError, NetworkEvent, Subscription};
use sentinel_types::{
    ConsensusProposal, FederationNode, Message, MessageType, NodeStatus, NodeSuspensionData,
    NodeUpdatePayload, ProposalStatus, ProposalType, SharedSignal, TrustAdjustmentData,
    VoteChoice, VotePayload, BROADCAST,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::handlers::{HandlerId, HandlerRegistry, MessageHandler};
use crate::proposals::{ProposalBook, VoteOutcome};
use crate::{ConsensusError, Result};

/// Consensus settings.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Fraction of known nodes that must approve.
    pub threshold: f64,
    /// Age after which a pending proposal expires.
    pub proposal_timeout: Duration,
    /// Whether a node may replace its vote while the proposal is pending.
    pub allow_revote: bool,
    pub sweep_interval: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            threshold: 2.0 / 3.0,
            proposal_timeout: Duration::from_secs(30),
            allow_revote: true,
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(ConsensusError::InvalidThreshold(self.threshold));
        }
        Ok(())
    }
}

/// Notifications published to consensus subscribers.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    ProposalCreated {
        proposal: ConsensusProposal,
    },
    ProposalReceived {
        proposal: ConsensusProposal,
    },
    VoteRecorded {
        proposal_id: String,
        voter_id: String,
        vote: VoteChoice,
    },
    ProposalStatusChanged {
        proposal_id: String,
        proposal_type: ProposalType,
        status: ProposalStatus,
    },
    SignalReceived {
        signal: SharedSignal,
        from_node: String,
    },
    NodeUpdated {
        node: FederationNode,
    },
    /// Message dropped before dispatch: unknown sender, bad signature,
    /// suspended sender or malformed payload.
    MessageRejected {
        message_id: String,
        sender_id: String,
        reason: String,
    },
}

/// One node's consensus engine, layered over its gossip network.
pub struct FederationCore {
    network: GossipNetwork,
    config: ConsensusConfig,
    proposals: RwLock<ProposalBook>,
    handlers: HandlerRegistry,
    events: EventBus<ConsensusEvent>,
    rejected: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FederationCore {
    pub fn new(network: GossipNetwork, config: ConsensusConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            network,
            config,
            proposals: RwLock::new(ProposalBook::new()),
            handlers: HandlerRegistry::new(),
            events: EventBus::new(),
            rejected: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn node_id(&self) -> &str {
        self.network.node_id()
    }

    pub fn network(&self) -> &GossipNetwork {
        &self.network
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn subscribe(&self) -> Subscription<ConsensusEvent> {
        self.events.subscribe()
    }

    /// Messages dropped by verification so far.
    pub fn rejected_messages(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Build and sign a message from this node.
    pub fn create_message<R: Into<String>>(
        &self,
        message_type: MessageType,
        payload: Value,
        recipient: R,
    ) -> Message {
        self.network.create_message(message_type, payload, recipient)
    }

    /// Check `message` against the sender's known public key. Unknown senders
    /// fail verification.
    pub fn verify_message(&self, message: &Message) -> bool {
        self.network
            .known_node(&message.sender_id)
            .is_some_and(|node| verify_message_signature(message, &node.public_key))
    }

    /// Register `handler` for verified messages of `message_type`.
    pub fn on<H: MessageHandler + 'static>(&self, message_type: MessageType, handler: H) -> HandlerId {
        self.handlers.register(message_type, Arc::new(handler))
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.handlers.unregister(id)
    }

    /// Start consuming network messages and sweeping stale proposals.
    pub fn start(self: &Arc<Self>) {
        let mut events = self.network.subscribe();
        let core = Arc::clone(self);
        let message_task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let NetworkEvent::MessageReceived { message, .. } = event {
                    // Peer exchange belongs to discovery.
                    if message.message_type != MessageType::PeerExchange {
                        core.handle_message(message).await;
                    }
                }
            }
        });

        let core = Arc::clone(self);
        let sweep_task = tokio::spawn(async move {
            let period = core.config.sweep_interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                core.expire_stale_proposals();
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(message_task);
        tasks.push(sweep_task);
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Verify, apply built-in consensus handling, then fan out to registered
    /// handlers. Rejected messages are logged and dropped.
    pub async fn handle_message(&self, message: Message) {
        if let Err(reason) = self.authenticate(&message) {
            self.reject(&message, reason);
            return;
        }

        self.network
            .update_node(&message.sender_id, FederationNode::touch);

        if let Err(err) = self.apply_builtin(&message) {
            self.reject(&message, format!("malformed payload: {err}"));
            return;
        }

        self.handlers.dispatch(&message).await;
    }

    fn authenticate(&self, message: &Message) -> std::result::Result<(), String> {
        let Some(sender) = self.network.known_node(&message.sender_id) else {
            return Err("unknown sender".to_string());
        };
        if !verify_message_signature(message, &sender.public_key) {
            return Err("invalid signature".to_string());
        }
        if sender.status == NodeStatus::Suspended {
            return Err("sender is suspended".to_string());
        }
        Ok(())
    }

    fn reject(&self, message: &Message, reason: String) {
        warn!(
            message_id = %message.id,
            sender = %message.sender_id,
            message_type = %message.message_type,
            %reason,
            "dropping message"
        );
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.events.publish(ConsensusEvent::MessageRejected {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            reason,
        });
    }

    fn apply_builtin(&self, message: &Message) -> serde_json::Result<()> {
        match message.message_type {
            MessageType::ConsensusProposal => {
                self.on_proposal(message.decode_payload()?, &message.sender_id);
            }
            MessageType::ConsensusVote => {
                self.on_vote(message.decode_payload()?, &message.sender_id);
            }
            MessageType::ThreatSignal => {
                let signal: SharedSignal = message.decode_payload()?;
                debug!(signal_id = %signal.id, from = %message.sender_id, "shared signal received");
                self.events.publish(ConsensusEvent::SignalReceived {
                    signal,
                    from_node: message.sender_id.clone(),
                });
            }
            MessageType::NodeUpdate => {
                let update: NodeUpdatePayload = message.decode_payload()?;
                if update.node_id != message.sender_id {
                    debug!(
                        node_id = %update.node_id,
                        sender = %message.sender_id,
                        "ignoring node update not sent by its owner"
                    );
                } else {
                    self.set_node_status(&update.node_id, update.status);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn on_proposal(&self, mut proposal: ConsensusProposal, sender_id: &str) {
        if proposal.proposer_id != sender_id {
            debug!(proposal_id = %proposal.id, sender = %sender_id, "ignoring relayed proposal claim");
            return;
        }
        // Only the proposer's own approval travels with the proposal; other
        // votes arrive as separately signed messages.
        proposal.votes.clear();
        proposal.votes.insert(proposal.proposer_id.clone(), VoteChoice::Approve);
        proposal.status = ProposalStatus::Pending;

        let id = proposal.id.clone();
        if !self.proposals.write().insert(proposal.clone()) {
            return;
        }
        info!(proposal_id = %id, proposal_type = ?proposal.proposal_type, proposer = %sender_id, "proposal received");
        self.events
            .publish(ConsensusEvent::ProposalReceived { proposal });

        let expired = self.proposals.write().expire_if_stale(
            &id,
            Utc::now(),
            self.config.proposal_timeout,
        );
        if expired {
            self.on_status_changed(&id, ProposalStatus::Expired);
        } else {
            self.evaluate_proposal(&id);
        }
    }

    fn on_vote(&self, vote: VotePayload, voter_id: &str) {
        let outcome = self.record_vote(&vote.proposal_id, voter_id, vote.vote);
        match outcome {
            Ok(true) => {}
            Ok(false) => {
                debug!(proposal_id = %vote.proposal_id, voter = %voter_id, "vote on finalized proposal ignored")
            }
            Err(err) => debug!(proposal_id = %vote.proposal_id, voter = %voter_id, error = %err, "vote ignored"),
        }
    }

    /// Record `vote` by `voter_id`, expiring the proposal first if it is
    /// stale. Returns whether the vote counted.
    fn record_vote(&self, proposal_id: &str, voter_id: &str, vote: VoteChoice) -> Result<bool> {
        let (expired, outcome) = {
            let mut book = self.proposals.write();
            if book.expire_if_stale(proposal_id, Utc::now(), self.config.proposal_timeout) {
                (true, VoteOutcome::NotPending(ProposalStatus::Expired))
            } else {
                let outcome =
                    book.record_vote(proposal_id, voter_id, vote, self.config.allow_revote);
                (false, outcome)
            }
        };
        if expired {
            self.on_status_changed(proposal_id, ProposalStatus::Expired);
        }

        match outcome {
            VoteOutcome::Recorded => {
                self.events.publish(ConsensusEvent::VoteRecorded {
                    proposal_id: proposal_id.to_string(),
                    voter_id: voter_id.to_string(),
                    vote,
                });
                self.evaluate_proposal(proposal_id);
                Ok(true)
            }
            VoteOutcome::NotPending(_) => Ok(false),
            VoteOutcome::UnknownProposal => {
                Err(ConsensusError::UnknownProposal(proposal_id.to_string()))
            }
            VoteOutcome::AlreadyVoted => Err(ConsensusError::AlreadyVoted(proposal_id.to_string())),
        }
    }

    /// Create a proposal carrying this node's approval, store it and
    /// broadcast it. Nothing is stored when the network is not running.
    pub async fn propose_consensus(
        &self,
        proposal_type: ProposalType,
        data: Value,
    ) -> Result<ConsensusProposal> {
        self.ensure_running()?;
        let proposal = ConsensusProposal::new(proposal_type, data, self.node_id());
        let message = self.create_message(
            MessageType::ConsensusProposal,
            serde_json::to_value(&proposal)?,
            BROADCAST,
        );

        // Stored before sending so votes racing the broadcast find it.
        self.proposals.write().insert(proposal.clone());
        let reached = match self.network.broadcast(&message).await {
            Ok(reached) => reached,
            Err(err) => {
                self.proposals.write().remove(&proposal.id);
                return Err(err.into());
            }
        };
        info!(proposal_id = %proposal.id, ?proposal_type, reached, "proposal created");
        self.events.publish(ConsensusEvent::ProposalCreated {
            proposal: proposal.clone(),
        });

        self.evaluate_proposal(&proposal.id);
        Ok(self.proposal(&proposal.id).unwrap_or(proposal))
    }

    /// Cast this node's vote and broadcast it. Returns `Ok(false)` when the
    /// proposal is no longer pending.
    pub async fn vote_on_proposal(&self, proposal_id: &str, vote: VoteChoice) -> Result<bool> {
        self.ensure_running()?;
        let node_id = self.node_id().to_string();
        if !self.record_vote(proposal_id, &node_id, vote)? {
            return Ok(false);
        }

        let payload = serde_json::to_value(VotePayload {
            proposal_id: proposal_id.to_string(),
            vote,
        })?;
        let message = self.create_message(MessageType::ConsensusVote, payload, BROADCAST);
        self.network.broadcast(&message).await?;
        Ok(true)
    }

    fn ensure_running(&self) -> Result<()> {
        if !self.network.is_running() {
            return Err(NetworkError::NotStarted.into());
        }
        Ok(())
    }

    pub fn proposal(&self, proposal_id: &str) -> Option<ConsensusProposal> {
        self.proposals.read().get(proposal_id).cloned()
    }

    pub fn proposals(&self) -> Vec<ConsensusProposal> {
        self.proposals.read().all().cloned().collect()
    }

    /// Node count used by the threshold rule: connected peers plus self.
    pub fn total_nodes(&self) -> usize {
        self.network.connected_peer_count() + 1
    }

    /// Expire every pending proposal older than the timeout.
    pub fn expire_stale_proposals(&self) -> Vec<String> {
        let expired = self
            .proposals
            .write()
            .expire_stale(Utc::now(), self.config.proposal_timeout);
        for id in &expired {
            self.on_status_changed(id, ProposalStatus::Expired);
        }
        expired
    }

    /// Broadcast a privacy-transformed signal. Returns how many peers it
    /// reached directly.
    pub async fn share_signal(&self, signal: &SharedSignal) -> Result<usize> {
        let message = self.create_message(
            MessageType::ThreatSignal,
            serde_json::to_value(signal)?,
            BROADCAST,
        );
        Ok(self.network.broadcast(&message).await?)
    }

    /// Change this node's status and announce it to the federation.
    pub async fn announce_status(&self, status: NodeStatus) -> Result<usize> {
        self.network.update_node(self.node_id(), |node| node.status = status);
        let payload = serde_json::to_value(NodeUpdatePayload {
            node_id: self.node_id().to_string(),
            status,
        })?;
        let message = self.create_message(MessageType::NodeUpdate, payload, BROADCAST);
        Ok(self.network.broadcast(&message).await?)
    }

    fn evaluate_proposal(&self, proposal_id: &str) {
        let total = self.total_nodes();
        let changed = self
            .proposals
            .write()
            .evaluate(proposal_id, total, self.config.threshold);
        if let Some(status) = changed {
            self.on_status_changed(proposal_id, status);
        }
    }

    fn on_status_changed(&self, proposal_id: &str, status: ProposalStatus) {
        let Some(proposal) = self.proposal(proposal_id) else {
            return;
        };
        info!(
            proposal_id = %proposal_id,
            proposal_type = ?proposal.proposal_type,
            ?status,
            approve = proposal.approve_count(),
            reject = proposal.reject_count(),
            "proposal finalized"
        );
        self.events.publish(ConsensusEvent::ProposalStatusChanged {
            proposal_id: proposal_id.to_string(),
            proposal_type: proposal.proposal_type,
            status,
        });
        if status == ProposalStatus::Approved {
            self.apply_approved(&proposal);
        }
    }

    fn apply_approved(&self, proposal: &ConsensusProposal) {
        let result = match proposal.proposal_type {
            ProposalType::NodeSuspension => serde_json::from_value::<NodeSuspensionData>(
                proposal.data.clone(),
            )
            .map(|data| self.set_node_status(&data.node_id, NodeStatus::Suspended)),
            ProposalType::TrustAdjustment => {
                serde_json::from_value::<TrustAdjustmentData>(proposal.data.clone()).map(|data| {
                    if self
                        .network
                        .update_node(&data.node_id, |node| node.set_trust_score(data.trust_score))
                    {
                        self.publish_node(&data.node_id);
                    }
                })
            }
            ProposalType::ThreatEscalation | ProposalType::PolicyChange => Ok(()),
        };
        if let Err(err) = result {
            warn!(proposal_id = %proposal.id, error = %err, "approved proposal carries malformed data");
        }
    }

    fn set_node_status(&self, node_id: &str, status: NodeStatus) {
        if self
            .network
            .update_node(node_id, |node| node.status = status)
        {
            self.publish_node(node_id);
        } else {
            debug!(node_id = %node_id, "status change for unknown node");
        }
    }

    fn publish_node(&self, node_id: &str) {
        if let Some(node) = self.network.known_node(node_id) {
            info!(node_id = %node.id, status = ?node.status, trust_score = node.trust_score, "node updated");
            self.events.publish(ConsensusEvent::NodeUpdated { node });
        }
    }
}
