//! Discovered-peer bookkeeping: bootstrap seeding, connection backoff,
//! failure accounting, peer exchange and DHT lookups.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sentinel_types::{FederationNode, PeerExchangePayload, PeerSummary};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::routing::{
    HashPrefixRoutingTable, KademliaRoutingTable, RoutingEntry, RoutingTable, DEFAULT_K,
};

/// Statically configured entry point into the federation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapPeer {
    pub address: String,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

impl BootstrapPeer {
    pub fn new<A: Into<String>>(address: A) -> Self {
        Self {
            address: address.into(),
            public_key: None,
            region: None,
        }
    }
}

/// Which routing table backs closest-node lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Buckets keyed by the first hash byte.
    #[default]
    HashPrefix,
    /// Bit-level Kademlia buckets relative to the local node.
    Kademlia,
}

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub bootstrap_peers: Vec<BootstrapPeer>,
    pub refresh_interval: Duration,
    /// Connections the refresh loop tries to maintain.
    pub target_peers: usize,
    pub max_discovered_peers: usize,
    pub backoff_step: Duration,
    pub max_backoff: Duration,
    /// Non-bootstrap peers are dropped after more failures than this.
    pub max_failures: u32,
    /// Peers shared per exchange.
    pub exchange_limit: usize,
    /// Routing bucket capacity.
    pub k: usize,
    pub routing: RoutingStrategy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers: vec![],
            refresh_interval: Duration::from_secs(30),
            target_peers: 8,
            max_discovered_peers: 1000,
            backoff_step: Duration::from_secs(30),
            max_backoff: Duration::from_secs(300),
            max_failures: 5,
            exchange_limit: 20,
            k: DEFAULT_K,
            routing: RoutingStrategy::HashPrefix,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    Bootstrap,
    PeerExchange,
    Dht,
}

/// What is known about a discovered peer before (or after) connecting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredNodeInfo {
    pub node_id: Option<String>,
    pub region: Option<String>,
    pub public_key: Option<String>,
    pub trust_score: Option<f64>,
}

impl From<&PeerSummary> for DiscoveredNodeInfo {
    fn from(summary: &PeerSummary) -> Self {
        Self {
            node_id: Some(summary.node_id.clone()),
            region: Some(summary.region.clone()),
            public_key: None,
            trust_score: Some(summary.trust_score),
        }
    }
}

impl From<&FederationNode> for DiscoveredNodeInfo {
    fn from(node: &FederationNode) -> Self {
        Self {
            node_id: Some(node.id.clone()),
            region: Some(node.region.clone()),
            public_key: Some(node.public_key.clone()),
            trust_score: Some(node.trust_score),
        }
    }
}

/// Discovered peer information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeer {
    pub address: String,
    pub node_info: Option<DiscoveredNodeInfo>,
    pub discovery_source: DiscoverySource,
    pub discovered_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub is_connected: bool,
}

impl DiscoveredPeer {
    pub fn new<A: Into<String>>(address: A, source: DiscoverySource) -> Self {
        Self {
            address: address.into(),
            node_info: None,
            discovery_source: source,
            discovered_at: Utc::now(),
            last_attempt_at: None,
            failure_count: 0,
            is_connected: false,
        }
    }

    pub fn is_bootstrap(&self) -> bool {
        self.discovery_source == DiscoverySource::Bootstrap
    }

    pub fn node_id(&self) -> Option<&str> {
        self.node_info.as_ref().and_then(|info| info.node_id.as_deref())
    }

    /// `min(failures * step, cap)` since the last attempt.
    pub fn backoff(&self, step: Duration, cap: Duration) -> Duration {
        step.saturating_mul(self.failure_count).min(cap)
    }

    fn ready_at(&self, now: DateTime<Utc>, step: Duration, cap: Duration) -> bool {
        let Some(last_attempt) = self.last_attempt_at else {
            return true;
        };
        let backoff = chrono::Duration::from_std(self.backoff(step, cap))
            .unwrap_or_else(|_| chrono::Duration::zero());
        now - last_attempt >= backoff
    }
}

/// Discovery statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryStats {
    pub total_peers: usize,
    pub bootstrap_peers: usize,
    pub peer_exchange_peers: usize,
    pub dht_peers: usize,
    pub connected_peers: usize,
    /// Peers with at least one failed attempt.
    pub failing_peers: usize,
    pub routing_entries: usize,
    pub exchanges_handled: u64,
}

/// Table of peers this node knows how to reach.
///
/// Keyed by address. Bootstrap peers are never evicted; other peers are
/// dropped after too many failures or when room is needed for newcomers.
pub struct PeerDiscovery {
    config: DiscoveryConfig,
    local_node_id: String,
    local_address: RwLock<Option<String>>,
    peers: RwLock<HashMap<String, DiscoveredPeer>>,
    routing: RwLock<Box<dyn RoutingTable>>,
    exchanges_handled: AtomicU64,
}

impl PeerDiscovery {
    /// Create the table and seed it with the configured bootstrap peers.
    pub fn new<I: Into<String>>(config: DiscoveryConfig, local_node_id: I) -> Self {
        let local_node_id = local_node_id.into();
        let routing: Box<dyn RoutingTable> = match config.routing {
            RoutingStrategy::HashPrefix => Box::new(HashPrefixRoutingTable::new(config.k)),
            RoutingStrategy::Kademlia => {
                Box::new(KademliaRoutingTable::new(&local_node_id, config.k))
            }
        };

        let mut peers = HashMap::new();
        for bootstrap in &config.bootstrap_peers {
            let mut peer = DiscoveredPeer::new(bootstrap.address.clone(), DiscoverySource::Bootstrap);
            if bootstrap.public_key.is_some() || bootstrap.region.is_some() {
                peer.node_info = Some(DiscoveredNodeInfo {
                    region: bootstrap.region.clone(),
                    public_key: bootstrap.public_key.clone(),
                    ..DiscoveredNodeInfo::default()
                });
            }
            peers.insert(bootstrap.address.clone(), peer);
        }

        Self {
            config,
            local_node_id,
            local_address: RwLock::new(None),
            peers: RwLock::new(peers),
            routing: RwLock::new(routing),
            exchanges_handled: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Record the address this node listens on so it is never dialled.
    pub fn set_local_address<A: Into<String>>(&self, address: A) {
        let address = address.into();
        self.peers.write().remove(&address);
        *self.local_address.write() = Some(address);
    }

    /// Register a peer. Returns false when it is this node, already known, or
    /// the table is full of peers that cannot be evicted.
    pub fn add_peer(
        &self,
        address: &str,
        source: DiscoverySource,
        info: Option<DiscoveredNodeInfo>,
    ) -> bool {
        if self.local_address.read().as_deref() == Some(address) {
            return false;
        }
        if let Some(node_id) = info.as_ref().and_then(|i| i.node_id.as_deref()) {
            if node_id == self.local_node_id {
                return false;
            }
            self.routing.write().add_node(node_id, address);
        }

        let mut peers = self.peers.write();
        if let Some(existing) = peers.get_mut(address) {
            if let Some(info) = info {
                existing.node_info = Some(info);
            }
            return false;
        }

        if peers.len() >= self.config.max_discovered_peers {
            let evictable = peers
                .values()
                .filter(|peer| !peer.is_bootstrap() && !peer.is_connected)
                .min_by_key(|peer| peer.discovered_at)
                .map(|peer| peer.address.clone());
            match evictable {
                Some(oldest) => {
                    debug!(target: "discovery", evicted = %oldest, "discovered-peer table full");
                    peers.remove(&oldest);
                }
                None => return false,
            }
        }

        let mut peer = DiscoveredPeer::new(address, source);
        peer.node_info = info;
        peers.insert(address.to_string(), peer);
        true
    }

    pub fn remove_peer(&self, address: &str) -> Option<DiscoveredPeer> {
        self.peers.write().remove(address)
    }

    pub fn get(&self, address: &str) -> Option<DiscoveredPeer> {
        self.peers.read().get(address).cloned()
    }

    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Up to `n` unconnected peers whose backoff has elapsed, bootstrap peers
    /// first, then fewest failures, then earliest discovered.
    pub fn get_peers_to_connect(&self, n: usize) -> Vec<DiscoveredPeer> {
        self.peers_to_connect_at(n, Utc::now())
    }

    pub fn peers_to_connect_at(&self, n: usize, now: DateTime<Utc>) -> Vec<DiscoveredPeer> {
        let step = self.config.backoff_step;
        let cap = self.config.max_backoff;
        let mut candidates: Vec<DiscoveredPeer> = self
            .peers
            .read()
            .values()
            .filter(|peer| !peer.is_connected && peer.ready_at(now, step, cap))
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            b.is_bootstrap()
                .cmp(&a.is_bootstrap())
                .then(a.failure_count.cmp(&b.failure_count))
                .then(a.discovered_at.cmp(&b.discovered_at))
        });
        candidates.truncate(n);
        candidates
    }

    pub fn mark_attempt(&self, address: &str) {
        if let Some(peer) = self.peers.write().get_mut(address) {
            peer.last_attempt_at = Some(Utc::now());
        }
    }

    /// Count a failed attempt. Returns true if the peer was dropped.
    pub fn record_failure(&self, address: &str) -> bool {
        let mut peers = self.peers.write();
        let Some(peer) = peers.get_mut(address) else {
            return false;
        };
        peer.failure_count += 1;
        peer.last_attempt_at = Some(Utc::now());
        peer.is_connected = false;

        if peer.is_bootstrap() || peer.failure_count <= self.config.max_failures {
            return false;
        }

        let node_id = peer.node_id().map(str::to_string);
        peers.remove(address);
        drop(peers);
        if let Some(node_id) = node_id {
            self.routing.write().remove_node(&node_id);
        }
        info!(target: "discovery", address, "dropping peer after repeated failures");
        true
    }

    /// A handshake completed with the peer reachable at `address`.
    pub fn mark_connected(&self, address: &str, node: &FederationNode) {
        self.routing.write().add_node(&node.id, address);
        if let Some(peer) = self.peers.write().get_mut(address) {
            peer.is_connected = true;
            peer.failure_count = 0;
            peer.node_info = Some(DiscoveredNodeInfo::from(node));
        }
    }

    pub fn mark_disconnected(&self, node_id: &str) {
        for peer in self.peers.write().values_mut() {
            if peer.node_id() == Some(node_id) {
                peer.is_connected = false;
            }
        }
    }

    /// Exchange payload listing up to `exchange_limit` of `connected` peers.
    pub fn build_exchange<I>(&self, connected: I, request_more: bool) -> PeerExchangePayload
    where
        I: IntoIterator<Item = PeerSummary>,
    {
        PeerExchangePayload {
            peers: connected
                .into_iter()
                .take(self.config.exchange_limit)
                .collect(),
            request_more,
        }
    }

    /// Register every offered peer. Returns how many were new.
    pub fn handle_exchange(&self, payload: &PeerExchangePayload) -> usize {
        self.exchanges_handled.fetch_add(1, Ordering::Relaxed);
        payload
            .peers
            .iter()
            .filter(|summary| {
                self.add_peer(
                    &summary.address,
                    DiscoverySource::PeerExchange,
                    Some(DiscoveredNodeInfo::from(*summary)),
                )
            })
            .count()
    }

    pub fn find_closest(&self, target_id: &str, count: usize) -> Vec<RoutingEntry> {
        self.routing.read().find_closest(target_id, count)
    }

    /// Re-admit routing-table contacts close to this node that have fallen
    /// out of the discovered-peer table. Returns how many were added.
    pub fn refill_from_dht(&self, count: usize) -> usize {
        let local = self.local_node_id.clone();
        self.find_closest(&local, count)
            .into_iter()
            .filter(|entry| {
                let info = DiscoveredNodeInfo {
                    node_id: Some(entry.node_id.clone()),
                    ..DiscoveredNodeInfo::default()
                };
                let known = self.peers.read().contains_key(&entry.address);
                !known && self.add_peer(&entry.address, DiscoverySource::Dht, Some(info))
            })
            .count()
    }

    pub fn stats(&self) -> DiscoveryStats {
        let peers = self.peers.read();
        let by_source =
            |source: DiscoverySource| peers.values().filter(|p| p.discovery_source == source).count();

        DiscoveryStats {
            total_peers: peers.len(),
            bootstrap_peers: by_source(DiscoverySource::Bootstrap),
            peer_exchange_peers: by_source(DiscoverySource::PeerExchange),
            dht_peers: by_source(DiscoverySource::Dht),
            connected_peers: peers.values().filter(|p| p.is_connected).count(),
            failing_peers: peers.values().filter(|p| p.failure_count > 0).count(),
            routing_entries: self.routing.read().len(),
            exchanges_handled: self.exchanges_handled.load(Ordering::Relaxed),
        }
    }
}
