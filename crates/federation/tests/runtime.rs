use chrono::Utc;
use sentinel_consensus::ConsensusEvent;
use sentinel_federation::{FederationConfig, FederationEvent, FederationRuntime};
use sentinel_network::MemoryHub;
use sentinel_types::{
    Indicator, IndicatorType, ProposalStatus, ProposalType, RiskTier, Severity, SignalType,
    ThreatSignal, VoteChoice,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(5);

fn config(id: &str, region: &str, port: u16) -> FederationConfig {
    let mut config = FederationConfig::new(id, region)
        .with_port(port)
        .with_bootstrap("mem://7201");
    config.discovery.refresh_interval = Duration::from_millis(50);
    config
}

/// Three nodes meshed through discovery from a single bootstrap address.
async fn federation() -> Vec<Arc<FederationRuntime>> {
    let hub = MemoryHub::new();
    let mut nodes = Vec::new();
    for (id, region, port) in [
        ("node-eu", "eu-west", 7201),
        ("node-us", "us-east", 7202),
        ("node-ap", "ap-south", 7203),
    ] {
        let runtime = FederationRuntime::new(config(id, region, port), Arc::new(hub.transport()))
            .unwrap();
        assert_ok!(runtime.start().await);
        nodes.push(runtime);
    }

    timeout(WAIT, async {
        while !nodes
            .iter()
            .all(|n| n.network().connected_peer_count() == 2)
        {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("federation did not form a full mesh");
    nodes
}

fn detection(pattern: &str, confidence: f64) -> ThreatSignal {
    ThreatSignal {
        id: "det-42".to_string(),
        signal_type: SignalType::Trafficking,
        severity: Severity::Critical,
        confidence,
        indicators: vec![
            Indicator::new(IndicatorType::NetworkPattern, pattern, 0.9),
            Indicator::new(IndicatorType::IpAddress, "203.0.113.9", 0.9),
        ],
        instance_count: 8,
        risk_tier: RiskTier::Immediate,
        source_agent_id: "crawler-1".to_string(),
        detected_at: Utc::now(),
    }
}

#[tokio::test]
async fn shared_signal_correlates_on_a_watching_peer() {
    let nodes = federation().await;
    let (eu, ap) = (&nodes[0], &nodes[2]);
    ap.watch_indicators([Indicator::new(
        IndicatorType::NetworkPattern,
        "relay-ring-17",
        0.8,
    )]);
    let mut ap_events = ap.subscribe();

    let shared = eu
        .share_signal(&detection("relay-ring-17", 0.95))
        .await
        .unwrap()
        .expect("confident signal is shared");
    assert_eq!(shared.indicators.len(), 1);

    let event = timeout(WAIT, ap_events.recv())
        .await
        .expect("no correlation")
        .expect("event bus closed");
    let FederationEvent::SignalCorrelated {
        signal,
        from_node,
        result,
    } = event;
    assert_eq!(signal.id, shared.id);
    assert_eq!(from_node, "node-eu");
    assert_eq!(result.matching_types, vec![IndicatorType::NetworkPattern]);

    assert_eq!(ap.status().signals_aggregated, 1);
    assert_eq!(eu.status().signals_aggregated, 1);
}

#[tokio::test]
async fn weak_signals_are_not_shared() {
    let nodes = federation().await;
    let shared = nodes[0]
        .share_signal(&detection("relay-ring-17", 0.3))
        .await
        .unwrap();
    assert!(shared.is_none());
    assert_eq!(nodes[0].status().signals_aggregated, 0);
}

#[tokio::test]
async fn discovered_federation_reaches_consensus() {
    let nodes = federation().await;
    let (eu, us) = (&nodes[0], &nodes[1]);
    let mut us_events = us.core().subscribe();
    let mut eu_events = eu.core().subscribe();

    let proposal = eu
        .core()
        .propose_consensus(ProposalType::ThreatEscalation, json!({"signal": "det-42"}))
        .await
        .unwrap();

    timeout(WAIT, async {
        loop {
            match us_events.recv().await {
                Some(ConsensusEvent::ProposalReceived { proposal: p }) if p.id == proposal.id => break,
                Some(_) => continue,
                None => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("proposal never arrived");

    assert!(us
        .core()
        .vote_on_proposal(&proposal.id, VoteChoice::Approve)
        .await
        .unwrap());

    timeout(WAIT, async {
        loop {
            match eu_events.recv().await {
                Some(ConsensusEvent::ProposalStatusChanged { proposal_id, status, .. })
                    if proposal_id == proposal.id =>
                {
                    assert_eq!(status, ProposalStatus::Approved);
                    break;
                }
                Some(_) => continue,
                None => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("proposal never finalized");

    let status = eu.status();
    assert_eq!(status.network.connected_peers, 2);
    assert_eq!(status.proposals, 1);
    assert_eq!(status.pending_proposals, 0);
}

#[tokio::test]
async fn stopping_a_node_disconnects_it() {
    let nodes = federation().await;
    assert_ok!(nodes[2].stop().await);

    timeout(WAIT, async {
        while nodes[0].network().is_connected_to("node-ap") {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peer still connected after stop");
    assert!(!nodes[2].network().is_running());
}
