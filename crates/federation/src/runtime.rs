//! Node runtime composing network, discovery, consensus and sharing.

use parking_lot::{Mutex, RwLock};
use sentinel_consensus::{ConsensusEvent, FederationCore};
use sentinel_crypto::NodeIdentity;
use sentinel_network::{
    DiscoveryService, DiscoveryStats, EventBus, GossipNetwork, NetworkHealth, PeerDiscovery,
    Subscription, Transport,
};
use sentinel_privacy::{AggregateSummary, MatchResult, SignalAggregator, SignalSharing};
use sentinel_types::{Indicator, ProposalStatus, SharedSignal, ThreatSignal};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::FederationConfig;
use crate::Result;

/// Notifications published by the runtime.
#[derive(Debug, Clone)]
pub enum FederationEvent {
    /// A peer's shared signal matched the local watchlist.
    SignalCorrelated {
        signal: SharedSignal,
        from_node: String,
        result: MatchResult,
    },
}

/// Point-in-time overview of a node.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationStatus {
    pub node_id: String,
    pub region: String,
    pub network: NetworkHealth,
    pub discovery: DiscoveryStats,
    pub proposals: usize,
    pub pending_proposals: usize,
    pub signals_aggregated: usize,
    pub rejected_messages: u64,
}

pub struct FederationRuntime {
    config: FederationConfig,
    network: GossipNetwork,
    discovery: Arc<DiscoveryService>,
    core: Arc<FederationCore>,
    sharing: SignalSharing,
    aggregator: Mutex<SignalAggregator>,
    watchlist: RwLock<Vec<Indicator>>,
    events: EventBus<FederationEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FederationRuntime {
    /// Runtime with a freshly generated identity.
    pub fn new(config: FederationConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        let identity = Arc::new(NodeIdentity::generate(
            config.node_id.clone(),
            config.region.clone(),
        ));
        Self::with_identity(config, identity, transport)
    }

    pub fn with_identity(
        config: FederationConfig,
        identity: Arc<NodeIdentity>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let network = GossipNetwork::new(config.network.clone(), identity, transport);
        let discovery = DiscoveryService::new(
            Arc::new(PeerDiscovery::new(
                config.discovery.clone(),
                config.node_id.clone(),
            )),
            network.clone(),
        );
        let core = FederationCore::new(network.clone(), config.consensus.clone())?;
        let sharing = SignalSharing::new(
            config.sharing.clone(),
            config.node_id.clone(),
            config.region.clone(),
        )?;

        Ok(Arc::new(Self {
            config,
            network,
            discovery,
            core,
            sharing,
            aggregator: Mutex::new(SignalAggregator::new()),
            watchlist: RwLock::new(Vec::new()),
            events: EventBus::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    pub fn network(&self) -> &GossipNetwork {
        &self.network
    }

    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    pub fn core(&self) -> &Arc<FederationCore> {
        &self.core
    }

    pub fn sharing(&self) -> &SignalSharing {
        &self.sharing
    }

    pub fn subscribe(&self) -> Subscription<FederationEvent> {
        self.events.subscribe()
    }

    /// Start listening, consensus, correlation and discovery, in that order.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.network.start().await?;
        self.core.start();

        let mut consensus_events = self.core.subscribe();
        let runtime = Arc::clone(self);
        let correlation_task = tokio::spawn(async move {
            while let Some(event) = consensus_events.recv().await {
                runtime.on_consensus_event(event);
            }
        });
        self.tasks.lock().push(correlation_task);

        self.discovery.start();
        info!(
            node_id = %self.node_id(),
            region = %self.config.region,
            endpoint = ?self.network.local_node().endpoint,
            "federation node started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.discovery.stop();
        self.core.stop();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.network.stop().await?;
        info!(node_id = %self.node_id(), "federation node stopped");
        Ok(())
    }

    /// Add raw local indicators that received signals are checked against.
    pub fn watch_indicators<I: IntoIterator<Item = Indicator>>(&self, indicators: I) {
        self.watchlist.write().extend(indicators);
    }

    /// Anonymize and broadcast a local detection. Returns `None` when the
    /// signal is below the sharing confidence gate.
    pub async fn share_signal(&self, signal: &ThreatSignal) -> Result<Option<SharedSignal>> {
        let Some(shared) = self.sharing.prepare_for_sharing(signal) else {
            return Ok(None);
        };
        self.aggregator.lock().record(&shared);
        let reached = self.core.share_signal(&shared).await?;
        info!(
            signal_id = %shared.id,
            signal_type = ?shared.signal_type,
            indicators = shared.indicators.len(),
            reached,
            "signal shared"
        );
        Ok(Some(shared))
    }

    pub fn aggregate_summaries(&self) -> Vec<AggregateSummary> {
        self.aggregator.lock().summaries()
    }

    pub fn status(&self) -> FederationStatus {
        let proposals = self.core.proposals();
        let pending_proposals = proposals
            .iter()
            .filter(|p| p.status == ProposalStatus::Pending)
            .count();
        FederationStatus {
            node_id: self.node_id().to_string(),
            region: self.config.region.clone(),
            network: self.network.health(),
            discovery: self.discovery.discovery().stats(),
            proposals: proposals.len(),
            pending_proposals,
            signals_aggregated: self.aggregator.lock().total_signals(),
            rejected_messages: self.core.rejected_messages(),
        }
    }

    fn on_consensus_event(&self, event: ConsensusEvent) {
        let ConsensusEvent::SignalReceived { signal, from_node } = event else {
            return;
        };
        if !self.aggregator.lock().record(&signal) {
            debug!(signal_id = %signal.id, "signal already aggregated");
            return;
        }

        let result = {
            let watchlist = self.watchlist.read();
            if watchlist.is_empty() {
                return;
            }
            self.sharing.check_match(&signal, &watchlist)
        };
        if result.matched {
            info!(
                signal_id = %signal.id,
                from = %from_node,
                matches = result.match_count,
                confidence = result.confidence,
                "received signal matches local indicators"
            );
            self.events.publish(FederationEvent::SignalCorrelated {
                signal,
                from_node,
                result,
            });
        }
    }
}
