use chrono::Utc;
use sentinel_consensus::{ConsensusConfig, ConsensusError, ConsensusEvent, FederationCore};
use sentinel_crypto::NodeIdentity;
use sentinel_network::{
    GossipNetwork, MemoryHub, NetworkConfig, NetworkError, NetworkEvent, Subscription,
};
use sentinel_types::{
    AnonymizedIndicator, ConsensusProposal, IndicatorType, Message, MessageType, NodeStatus,
    ProposalStatus, ProposalType, RiskTier, Severity, SharedSignal, SignalType, VoteChoice,
    VotePayload, BROADCAST,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(3);

async fn start_core(
    hub: &Arc<MemoryHub>,
    id: &str,
    port: u16,
    config: ConsensusConfig,
) -> Arc<FederationCore> {
    let network = GossipNetwork::new(
        NetworkConfig {
            port,
            ..NetworkConfig::default()
        },
        Arc::new(NodeIdentity::generate(id, "eu-west")),
        Arc::new(hub.transport()),
    );
    network.start().await.unwrap();
    let core = FederationCore::new(network, config).unwrap();
    core.start();
    core
}

async fn wait_for_network<F>(events: &mut Subscription<NetworkEvent>, predicate: F)
where
    F: Fn(&NetworkEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if predicate(&event) {
                return;
            }
        }
    })
    .await
    .expect("timed out waiting for network event")
}

async fn next_event<F>(events: &mut Subscription<ConsensusEvent>, predicate: F) -> ConsensusEvent
where
    F: Fn(&ConsensusEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for consensus event")
}

fn status_of(id: String, status: ProposalStatus) -> impl Fn(&ConsensusEvent) -> bool {
    move |event| {
        matches!(event, ConsensusEvent::ProposalStatusChanged { proposal_id, status: s, .. }
            if *proposal_id == id && *s == status)
    }
}

fn received_proposal(id: String) -> impl Fn(&ConsensusEvent) -> bool {
    move |event| matches!(event, ConsensusEvent::ProposalReceived { proposal } if proposal.id == id)
}

async fn link(a: &FederationCore, b: &FederationCore) {
    let mut a_events = a.network().subscribe();
    let mut b_events = b.network().subscribe();
    let address = b.network().local_node().endpoint.expect("listening");
    a.network().connect(&address).await.unwrap();

    let b_id = b.node_id().to_string();
    let a_id = a.node_id().to_string();
    wait_for_network(&mut a_events, move |e| {
        matches!(e, NetworkEvent::PeerConnected { node, .. } if node.id == b_id)
    })
    .await;
    wait_for_network(&mut b_events, move |e| {
        matches!(e, NetworkEvent::PeerConnected { node, .. } if node.id == a_id)
    })
    .await;
}

/// Three fully meshed nodes.
async fn mesh(config: ConsensusConfig) -> Vec<Arc<FederationCore>> {
    let hub = MemoryHub::new();
    let a = start_core(&hub, "node-a", 7101, config.clone()).await;
    let b = start_core(&hub, "node-b", 7102, config.clone()).await;
    let c = start_core(&hub, "node-c", 7103, config).await;
    link(&a, &b).await;
    link(&a, &c).await;
    link(&b, &c).await;
    vec![a, b, c]
}

fn sample_signal(source: &str) -> SharedSignal {
    SharedSignal {
        id: "5d1f".to_string(),
        signal_type: SignalType::Grooming,
        severity: Severity::High,
        confidence: 0.9,
        indicators: vec![AnonymizedIndicator {
            indicator_type: IndicatorType::BehavioralPattern,
            hashed_value: "ab12".to_string(),
            confidence: 0.8,
        }],
        instance_count: 3,
        risk_tier: RiskTier::High,
        source_node_id: source.to_string(),
        source_region: "eu-west".to_string(),
        shared_at: Utc::now(),
    }
}

#[tokio::test]
async fn single_node_approves_its_own_proposal() {
    let hub = MemoryHub::new();
    let core = start_core(&hub, "node-a", 7100, ConsensusConfig::default()).await;

    let proposal = assert_ok!(
        core.propose_consensus(ProposalType::PolicyChange, json!({"policy": "retain-7d"}))
            .await
    );
    assert_eq!(proposal.status, ProposalStatus::Approved);
    assert_eq!(core.total_nodes(), 1);
}

#[tokio::test]
async fn second_approval_reaches_two_thirds() {
    let nodes = mesh(ConsensusConfig::default()).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    let mut c_events = c.subscribe();

    let proposal = a
        .propose_consensus(ProposalType::ThreatEscalation, json!({"signal": "5d1f"}))
        .await
        .unwrap();
    assert_eq!(proposal.status, ProposalStatus::Pending);
    assert_eq!(a.total_nodes(), 3);

    next_event(&mut b_events, received_proposal(proposal.id.clone())).await;
    assert!(b.vote_on_proposal(&proposal.id, VoteChoice::Approve).await.unwrap());

    for events in [&mut a_events, &mut b_events, &mut c_events] {
        next_event(events, status_of(proposal.id.clone(), ProposalStatus::Approved)).await;
    }
    for node in &nodes {
        let stored = node.proposal(&proposal.id).unwrap();
        assert_eq!(stored.status, ProposalStatus::Approved);
        assert_eq!(stored.approve_count(), 2);
    }

    // Finalized proposals ignore further votes.
    assert!(!c.vote_on_proposal(&proposal.id, VoteChoice::Reject).await.unwrap());
}

#[tokio::test]
async fn two_rejections_reject_the_proposal() {
    let nodes = mesh(ConsensusConfig::default()).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    let mut c_events = c.subscribe();

    let proposal = a
        .propose_consensus(ProposalType::ThreatEscalation, json!({}))
        .await
        .unwrap();
    next_event(&mut b_events, received_proposal(proposal.id.clone())).await;
    next_event(&mut c_events, received_proposal(proposal.id.clone())).await;

    assert_ok!(b.vote_on_proposal(&proposal.id, VoteChoice::Reject).await);
    assert_ok!(c.vote_on_proposal(&proposal.id, VoteChoice::Reject).await);

    next_event(&mut a_events, status_of(proposal.id.clone(), ProposalStatus::Rejected)).await;
    let stored = a.proposal(&proposal.id).unwrap();
    assert_eq!(stored.reject_count(), 2);
    assert_eq!(stored.approve_count(), 1);
}

#[tokio::test]
async fn revote_overwrites_previous_vote() {
    let nodes = mesh(ConsensusConfig::default()).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let proposal = a
        .propose_consensus(ProposalType::ThreatEscalation, json!({}))
        .await
        .unwrap();
    next_event(&mut b_events, received_proposal(proposal.id.clone())).await;

    assert!(b.vote_on_proposal(&proposal.id, VoteChoice::Reject).await.unwrap());
    assert!(b.vote_on_proposal(&proposal.id, VoteChoice::Approve).await.unwrap());

    next_event(&mut a_events, status_of(proposal.id.clone(), ProposalStatus::Approved)).await;
    assert_eq!(a.proposal(&proposal.id).unwrap().reject_count(), 0);
}

#[tokio::test]
async fn revote_refused_when_disabled() {
    let nodes = mesh(ConsensusConfig {
        allow_revote: false,
        ..ConsensusConfig::default()
    })
    .await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let mut b_events = b.subscribe();

    let proposal = a
        .propose_consensus(ProposalType::ThreatEscalation, json!({}))
        .await
        .unwrap();
    next_event(&mut b_events, received_proposal(proposal.id.clone())).await;

    assert!(b.vote_on_proposal(&proposal.id, VoteChoice::Reject).await.unwrap());
    assert!(matches!(
        b.vote_on_proposal(&proposal.id, VoteChoice::Approve).await,
        Err(ConsensusError::AlreadyVoted(_))
    ));
    assert!(matches!(
        b.vote_on_proposal("missing", VoteChoice::Approve).await,
        Err(ConsensusError::UnknownProposal(_))
    ));
}

#[tokio::test]
async fn stale_proposals_expire_and_ignore_votes() {
    let nodes = mesh(ConsensusConfig {
        proposal_timeout: Duration::from_millis(50),
        sweep_interval: Duration::from_millis(10),
        ..ConsensusConfig::default()
    })
    .await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let proposal = a
        .propose_consensus(ProposalType::ThreatEscalation, json!({}))
        .await
        .unwrap();

    next_event(&mut a_events, status_of(proposal.id.clone(), ProposalStatus::Expired)).await;
    next_event(&mut b_events, status_of(proposal.id.clone(), ProposalStatus::Expired)).await;

    assert!(!b.vote_on_proposal(&proposal.id, VoteChoice::Approve).await.unwrap());
    assert_eq!(a.proposal(&proposal.id).unwrap().status, ProposalStatus::Expired);
}

#[tokio::test]
async fn approved_suspension_rejects_the_suspended_sender() {
    let nodes = mesh(ConsensusConfig::default()).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let proposal = a
        .propose_consensus(
            ProposalType::NodeSuspension,
            json!({"nodeId": "node-c", "reason": "forged signals"}),
        )
        .await
        .unwrap();
    next_event(&mut b_events, received_proposal(proposal.id.clone())).await;
    b.vote_on_proposal(&proposal.id, VoteChoice::Approve).await.unwrap();

    next_event(&mut a_events, |e| {
        matches!(e, ConsensusEvent::NodeUpdated { node } if node.id == "node-c")
    })
    .await;
    assert_eq!(
        a.network().known_node("node-c").unwrap().status,
        NodeStatus::Suspended
    );

    c.share_signal(&sample_signal("node-c")).await.unwrap();
    next_event(&mut a_events, |e| {
        matches!(e, ConsensusEvent::MessageRejected { sender_id, .. } if sender_id == "node-c")
    })
    .await;
}

#[tokio::test]
async fn approved_trust_adjustment_updates_the_roster() {
    let nodes = mesh(ConsensusConfig::default()).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let proposal = a
        .propose_consensus(
            ProposalType::TrustAdjustment,
            json!({"nodeId": "node-c", "trustScore": 0.4}),
        )
        .await
        .unwrap();
    next_event(&mut b_events, received_proposal(proposal.id.clone())).await;
    b.vote_on_proposal(&proposal.id, VoteChoice::Approve).await.unwrap();

    next_event(&mut a_events, |e| {
        matches!(e, ConsensusEvent::NodeUpdated { node } if node.id == "node-c")
    })
    .await;
    assert_eq!(a.network().known_node("node-c").unwrap().trust_score, 0.4);
}

#[tokio::test]
async fn shared_signals_reach_handlers_despite_failing_ones() {
    let nodes = mesh(ConsensusConfig::default()).await;
    let (a, c) = (&nodes[0], &nodes[2]);
    let mut c_events = c.subscribe();

    let hits = Arc::new(AtomicUsize::new(0));
    c.on(MessageType::ThreatSignal, |_message: Message| async {
        Err::<(), _>(anyhow::anyhow!("correlation backend offline"))
    });
    let counter = Arc::clone(&hits);
    c.on(MessageType::ThreatSignal, move |_message: Message| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        }
    });

    a.share_signal(&sample_signal("node-a")).await.unwrap();
    let event = next_event(&mut c_events, |e| {
        matches!(e, ConsensusEvent::SignalReceived { .. })
    })
    .await;
    if let ConsensusEvent::SignalReceived { signal, from_node } = event {
        assert_eq!(from_node, "node-a");
        assert_eq!(signal.indicators.len(), 1);
    }

    timeout(WAIT, async {
        while hits.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("handler never ran");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unverifiable_messages_are_rejected() {
    let nodes = mesh(ConsensusConfig::default()).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let mut a_events = a.subscribe();

    let genuine = b.create_message(MessageType::ThreatSignal, json!({"k": 1}), BROADCAST);
    assert!(a.verify_message(&genuine));

    let mut tampered = genuine.clone();
    tampered.payload = json!({"k": 2});
    assert!(!a.verify_message(&tampered));

    let stranger = NodeIdentity::generate("node-x", "ap-south");
    let unknown = stranger.create_message(MessageType::ThreatSignal, json!({}), BROADCAST);
    assert!(!a.verify_message(&unknown));

    a.handle_message(tampered).await;
    a.handle_message(unknown).await;
    assert_eq!(a.rejected_messages(), 2);

    let event = next_event(&mut a_events, |e| matches!(e, ConsensusEvent::MessageRejected { .. })).await;
    if let ConsensusEvent::MessageRejected { sender_id, reason, .. } = event {
        assert_eq!(sender_id, "node-b");
        assert_eq!(reason, "invalid signature");
    }
}

#[tokio::test]
async fn node_updates_only_apply_from_their_owner() {
    let nodes = mesh(ConsensusConfig::default()).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let mut a_events = a.subscribe();

    b.announce_status(NodeStatus::Inactive).await.unwrap();
    next_event(&mut a_events, |e| {
        matches!(e, ConsensusEvent::NodeUpdated { node } if node.id == "node-b")
    })
    .await;
    assert_eq!(
        a.network().known_node("node-b").unwrap().status,
        NodeStatus::Inactive
    );

    // b claims a status for node-c; a ignores it.
    let forged = b.create_message(
        MessageType::NodeUpdate,
        json!({"nodeId": "node-c", "status": "suspended"}),
        BROADCAST,
    );
    a.handle_message(forged).await;
    assert_eq!(
        a.network().known_node("node-c").unwrap().status,
        NodeStatus::Active
    );
}

#[tokio::test]
async fn proposals_and_votes_need_a_running_network() {
    let hub = MemoryHub::new();
    let network = GossipNetwork::new(
        NetworkConfig {
            port: 7120,
            ..NetworkConfig::default()
        },
        Arc::new(NodeIdentity::generate("node-a", "eu-west")),
        Arc::new(hub.transport()),
    );
    let core = FederationCore::new(network, ConsensusConfig::default()).unwrap();
    let mut events = core.subscribe();

    let proposed = core
        .propose_consensus(ProposalType::ThreatEscalation, json!({}))
        .await;
    assert!(matches!(
        proposed,
        Err(ConsensusError::Network(NetworkError::NotStarted))
    ));
    assert_eq!(core.proposals().len(), 0);

    let voted = core.vote_on_proposal("p-1", VoteChoice::Approve).await;
    assert!(matches!(
        voted,
        Err(ConsensusError::Network(NetworkError::NotStarted))
    ));
    assert!(events.try_recv().is_none());
}

#[tokio::test]
async fn votes_ahead_of_their_proposal_are_dropped() {
    let nodes = mesh(ConsensusConfig::default()).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    let proposal = ConsensusProposal::new(ProposalType::ThreatEscalation, json!({}), "node-b");
    let early_vote = c.create_message(
        MessageType::ConsensusVote,
        serde_json::to_value(VotePayload {
            proposal_id: proposal.id.clone(),
            vote: VoteChoice::Approve,
        })
        .unwrap(),
        BROADCAST,
    );
    let mut a_events = a.subscribe();
    a.handle_message(early_vote).await;
    assert!(a.proposals().is_empty());
    assert_eq!(a.rejected_messages(), 0);

    // The proposal turns up afterwards; the early vote is not replayed.
    let announced = b.create_message(
        MessageType::ConsensusProposal,
        serde_json::to_value(&proposal).unwrap(),
        BROADCAST,
    );
    a.handle_message(announced).await;
    let stored = a.proposal(&proposal.id).unwrap();
    assert_eq!(stored.votes.len(), 1);
    assert_eq!(stored.votes.get("node-b"), Some(&VoteChoice::Approve));
    assert_eq!(stored.status, ProposalStatus::Pending);

    while let Some(event) = a_events.try_recv() {
        assert!(!matches!(event, ConsensusEvent::VoteRecorded { .. }));
    }
}
