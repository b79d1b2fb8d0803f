//! In-process federation over an isolated memory transport.

use anyhow::Result;
use chrono::Utc;
use sentinel_federation::{FederationEvent, FederationRuntime, FederationStatus};
use sentinel_network::MemoryHub;
use sentinel_types::{
    Indicator, IndicatorType, ProposalStatus, ProposalType, RiskTier, Severity, SignalType,
    ThreatSignal, VoteChoice,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

use crate::app_config::AppConfig;

const REGIONS: &[&str] = &["eu-west", "us-east", "ap-south", "sa-east", "af-south"];
const WATCHED_PATTERN: &str = "relay-ring-17";
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy)]
pub struct SimulationOptions {
    pub nodes: usize,
    /// Upper bound for each phase: mesh formation, voting and correlation.
    pub duration: Duration,
}

#[derive(Debug)]
pub struct SimulationReport {
    pub meshed: bool,
    pub proposal_status: ProposalStatus,
    pub correlated: bool,
    pub statuses: Vec<FederationStatus>,
}

/// Start `options.nodes` nodes bootstrapped from the first one, run one
/// proposal through consensus and share one detection.
pub async fn run(app: &AppConfig, options: SimulationOptions) -> Result<SimulationReport> {
    if options.nodes == 0 {
        anyhow::bail!("simulation needs at least one node");
    }
    let hub = MemoryHub::new();
    let bootstrap = format!("mem://{}", app.port);

    let mut nodes = Vec::with_capacity(options.nodes);
    for index in 0..options.nodes {
        let mut config = app.federation_config();
        config.node_id = format!("{}-{}", app.node_id, index + 1);
        config.region = REGIONS[index % REGIONS.len()].to_string();
        config.network.port = app.port.saturating_add(index as u16);
        config.discovery.bootstrap_peers.clear();
        let mut config = config.with_bootstrap(bootstrap.as_str());
        config.discovery.refresh_interval = Duration::from_millis(100);

        let runtime = FederationRuntime::new(config, Arc::new(hub.transport()))?;
        runtime.start().await?;
        nodes.push(runtime);
    }

    let result = drive(&nodes, options).await;
    for node in &nodes {
        if let Err(err) = node.stop().await {
            warn!(node_id = %node.node_id(), error = %err, "failed to stop node");
        }
    }
    result
}

async fn drive(nodes: &[Arc<FederationRuntime>], options: SimulationOptions) -> Result<SimulationReport> {
    let expected_peers = nodes.len() - 1;
    let meshed = wait_until(options.duration, move || async move {
        nodes
            .iter()
            .all(|n| n.network().connected_peer_count() == expected_peers)
    })
    .await;
    if meshed {
        info!(nodes = nodes.len(), "federation mesh formed");
    } else {
        warn!(nodes = nodes.len(), "federation mesh incomplete, continuing");
    }

    let proposer = &nodes[0];
    let proposal = proposer
        .core()
        .propose_consensus(
            ProposalType::ThreatEscalation,
            json!({ "signalType": "coordinated_abuse", "reason": "simulated escalation" }),
        )
        .await?;
    info!(proposal_id = %proposal.id, proposer = %proposer.node_id(), "proposal created");
    let proposal_id = proposal.id.as_str();

    for voter in &nodes[1..] {
        let arrived = wait_until(options.duration, move || async move {
            voter.core().proposal(proposal_id).is_some()
        })
        .await;
        if !arrived {
            warn!(node_id = %voter.node_id(), "proposal never arrived");
            continue;
        }
        match voter.core().vote_on_proposal(proposal_id, VoteChoice::Approve).await {
            Ok(recorded) => info!(node_id = %voter.node_id(), recorded, "vote cast"),
            Err(err) => warn!(node_id = %voter.node_id(), error = %err, "vote failed"),
        }
    }

    wait_until(options.duration, move || async move {
        proposer
            .core()
            .proposal(proposal_id)
            .map(|p| p.status != ProposalStatus::Pending)
            .unwrap_or(false)
    })
    .await;
    let proposal_status = proposer
        .core()
        .proposal(proposal_id)
        .map(|p| p.status)
        .unwrap_or(ProposalStatus::Pending);
    info!(proposal_id = %proposal_id, status = ?proposal_status, "proposal outcome");

    let watcher = &nodes[nodes.len() - 1];
    watcher.watch_indicators([Indicator::new(
        IndicatorType::NetworkPattern,
        WATCHED_PATTERN,
        0.8,
    )]);
    let mut correlations = watcher.subscribe();

    let shared = proposer.share_signal(&sample_detection()).await?;
    let correlated = match shared {
        Some(_) if !Arc::ptr_eq(proposer, watcher) => {
            matches!(
                timeout(options.duration, correlations.recv()).await,
                Ok(Some(FederationEvent::SignalCorrelated { .. }))
            )
        }
        _ => false,
    };
    info!(correlated, watcher = %watcher.node_id(), "signal correlation");

    let statuses: Vec<FederationStatus> = nodes.iter().map(|n| n.status()).collect();
    for status in &statuses {
        info!(
            node_id = %status.node_id,
            region = %status.region,
            peers = status.network.connected_peers,
            proposals = status.proposals,
            signals = status.signals_aggregated,
            rejected = status.rejected_messages,
            "node status"
        );
    }

    Ok(SimulationReport {
        meshed,
        proposal_status,
        correlated,
        statuses,
    })
}

fn sample_detection() -> ThreatSignal {
    ThreatSignal {
        id: format!("sim-{}", Utc::now().timestamp_millis()),
        signal_type: SignalType::CoordinatedAbuse,
        severity: Severity::High,
        confidence: 0.93,
        indicators: vec![
            Indicator::new(IndicatorType::NetworkPattern, WATCHED_PATTERN, 0.9),
            Indicator::new(IndicatorType::IpAddress, "198.51.100.23", 0.95),
        ],
        instance_count: 12,
        risk_tier: RiskTier::Elevated,
        source_agent_id: "simulator".to_string(),
        detected_at: Utc::now(),
    }
}

/// Poll `check` until it holds or `limit` elapses.
async fn wait_until<F, Fut>(limit: Duration, check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}
