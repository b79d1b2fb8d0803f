//! Drives [`PeerDiscovery`] from a running [`GossipNetwork`]: periodic
//! refresh, connection bookkeeping and the peer-exchange protocol.

use parking_lot::Mutex;
use sentinel_crypto::verify_message_signature;
use sentinel_types::{Message, MessageType, PeerExchangePayload, PeerSummary};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::PeerDiscovery;
use crate::error::{NetworkError, Result};
use crate::gossip::{GossipNetwork, NetworkEvent};

/// Discovery loop attached to one gossip network.
pub struct DiscoveryService {
    discovery: Arc<PeerDiscovery>,
    network: GossipNetwork,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_exchange: AtomicUsize,
}

impl DiscoveryService {
    pub fn new(discovery: Arc<PeerDiscovery>, network: GossipNetwork) -> Arc<Self> {
        Arc::new(Self {
            discovery,
            network,
            tasks: Mutex::new(Vec::new()),
            next_exchange: AtomicUsize::new(0),
        })
    }

    pub fn discovery(&self) -> &Arc<PeerDiscovery> {
        &self.discovery
    }

    /// Start reacting to network events and refreshing on an interval. The
    /// network must already be started.
    pub fn start(self: &Arc<Self>) {
        if let Some(address) = self.network.local_node().endpoint {
            self.discovery.set_local_address(address);
        }

        // Subscribe before the first refresh so no handshake is missed.
        let events = self.network.subscribe();
        let service = Arc::clone(self);
        let event_task = tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.recv().await {
                service.on_network_event(event).await;
            }
        });

        let service = Arc::clone(self);
        let refresh_task = tokio::spawn(async move {
            let period = service
                .discovery
                .config()
                .refresh_interval
                .max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                service.refresh().await;
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(event_task);
        tasks.push(refresh_task);
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Dial discovered peers until the target connection count is reached,
    /// then ask one connected peer for more addresses if still short.
    /// Returns how many links were opened.
    pub async fn refresh(&self) -> usize {
        let target = self.discovery.config().target_peers;
        let needed = target.saturating_sub(self.network.connected_peer_count());
        if needed == 0 {
            return 0;
        }

        let mut candidates = self.candidates(needed);
        if candidates.is_empty() && self.discovery.refill_from_dht(needed) > 0 {
            candidates = self.candidates(needed);
        }

        let mut opened = 0;
        for address in candidates {
            self.discovery.mark_attempt(&address);
            match self.network.connect(&address).await {
                Ok(_) => opened += 1,
                Err(NetworkError::MaxPeersReached(max)) => {
                    debug!(target: "discovery", max, "peer limit reached during refresh");
                    break;
                }
                Err(NetworkError::NotStarted) => break,
                Err(err) => {
                    debug!(target: "discovery", %address, error = %err, "connection attempt failed");
                    self.discovery.record_failure(&address);
                }
            }
        }

        if opened > 0 {
            debug!(target: "discovery", opened, "discovery refresh");
        }
        self.request_exchange().await;
        opened
    }

    /// Round-robin peer-exchange request to one connected peer.
    async fn request_exchange(&self) {
        let peers = self.network.connected_peers();
        if peers.is_empty() {
            return;
        }
        let index = self.next_exchange.fetch_add(1, Ordering::Relaxed) % peers.len();
        let node_id = &peers[index].id;
        if let Err(err) = self.send_exchange(node_id, true).await {
            debug!(target: "discovery", peer = %node_id, error = %err, "peer exchange request failed");
        }
    }

    fn candidates(&self, needed: usize) -> Vec<String> {
        self.discovery
            .get_peers_to_connect(needed)
            .into_iter()
            .filter(|peer| {
                !self.network.has_link_to(&peer.address)
                    && !peer
                        .node_id()
                        .is_some_and(|id| self.network.is_connected_to(id))
            })
            .map(|peer| peer.address)
            .collect()
    }

    /// Connected peers, as shared during peer exchange.
    fn connected_summaries(&self) -> Vec<PeerSummary> {
        self.network
            .connected_links()
            .into_iter()
            .filter_map(|link| {
                let address = link.reachable_address()?;
                let node = link.node?;
                Some(PeerSummary {
                    address,
                    node_id: node.id,
                    region: node.region,
                    trust_score: node.trust_score,
                })
            })
            .collect()
    }

    /// Send our peer list to `node_id`.
    pub async fn send_exchange(&self, node_id: &str, request_more: bool) -> Result<()> {
        let payload = self
            .discovery
            .build_exchange(self.connected_summaries(), request_more);
        let message = self.network.create_message(
            MessageType::PeerExchange,
            serde_json::to_value(payload)?,
            node_id,
        );
        self.network.send(node_id, &message).await
    }

    async fn on_network_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::PeerConnected { node, address } => {
                if let Some(address) = address {
                    self.discovery.mark_connected(&address, &node);
                }
                if let Err(err) = self.send_exchange(&node.id, true).await {
                    debug!(target: "discovery", peer = %node.id, error = %err, "peer exchange request failed");
                }
            }
            NetworkEvent::PeerDisconnected { node_id } => {
                self.discovery.mark_disconnected(&node_id);
            }
            NetworkEvent::MessageReceived { message, from }
                if message.message_type == MessageType::PeerExchange =>
            {
                self.on_exchange(message, &from).await;
            }
            _ => {}
        }
    }

    async fn on_exchange(&self, message: Message, from: &str) {
        // Exchanges are only accepted straight from the neighbour that sent them.
        let authentic = message.sender_id == from
            && self
                .network
                .known_node(from)
                .is_some_and(|node| verify_message_signature(&message, &node.public_key));
        if !authentic {
            warn!(target: "discovery", peer = %from, "rejecting unauthenticated peer exchange");
            return;
        }

        let payload: PeerExchangePayload = match message.decode_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "discovery", peer = %from, error = %err, "malformed peer exchange");
                return;
            }
        };

        let added = self.discovery.handle_exchange(&payload);
        if added > 0 {
            info!(target: "discovery", peer = %from, added, "learned peers via exchange");
        }

        if payload.request_more {
            if let Err(err) = self.send_exchange(from, false).await {
                debug!(target: "discovery", peer = %from, error = %err, "peer exchange reply failed");
            }
        }
    }
}
