//! Gossip network: link lifecycle, handshakes, heartbeats and TTL-bounded
//! flooding over any [`Transport`].

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use sentinel_crypto::{verify_message_signature, NodeIdentity};
use sentinel_types::{
    FederationNode, HandshakePayload, HeartbeatPayload, Message, MessageType, BROADCAST,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::deduplication::MessageDeduplicator;
use crate::error::{NetworkError, Result, TransportError};
use crate::events::{EventBus, Subscription};
use crate::health::NetworkHealth;
use crate::metrics::{NetworkMetrics, NetworkMetricsSnapshot};
use crate::peers::{PeerConnection, PeerTable, PromoteError};
use crate::transport::{Transport, TransportEvent};

/// Gossip network settings.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port the transport listens on.
    pub port: u16,
    pub max_peers: usize,
    pub heartbeat_interval: Duration,
    /// Missed heartbeat intervals before a peer counts as stale.
    pub stale_after_heartbeats: u32,
    pub connect_timeout: Duration,
    /// Upper bound on remembered message ids.
    pub dedup_capacity: usize,
    pub cleanup_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 7400,
            max_peers: 50,
            heartbeat_interval: Duration::from_secs(30),
            stale_after_heartbeats: 3,
            connect_timeout: Duration::from_secs(5),
            dedup_capacity: 10_000,
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

impl NetworkConfig {
    /// Window after which a silent peer is evicted.
    pub fn stale_window(&self) -> Duration {
        self.heartbeat_interval * self.stale_after_heartbeats.max(1)
    }
}

/// Notifications published to network subscribers.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// Handshake completed with an authenticated node.
    PeerConnected {
        node: FederationNode,
        /// Address the peer can be dialled at, when known.
        address: Option<String>,
    },
    PeerDisconnected {
        node_id: String,
    },
    /// Gossip or directed message addressed to this node. `from` is the node
    /// id of the neighbour that delivered it.
    MessageReceived {
        message: Message,
        from: String,
    },
    NetworkError {
        peer_id: Option<String>,
        reason: String,
    },
}

struct Inner {
    config: NetworkConfig,
    identity: Arc<NodeIdentity>,
    local_node: RwLock<FederationNode>,
    transport: Arc<dyn Transport>,
    peers: RwLock<PeerTable>,
    dedup: MessageDeduplicator,
    metrics: NetworkMetrics,
    events: EventBus<NetworkEvent>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One node's view of the gossip overlay.
///
/// Owns the node's single peer roster; higher layers query it for membership
/// and send through it. Cloning yields another handle to the same network.
#[derive(Clone)]
pub struct GossipNetwork {
    inner: Arc<Inner>,
}

impl GossipNetwork {
    pub fn new(
        config: NetworkConfig,
        identity: Arc<NodeIdentity>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let local_node = identity.descriptor();
        let dedup = MessageDeduplicator::new(config.dedup_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                identity,
                local_node: RwLock::new(local_node),
                transport,
                peers: RwLock::new(PeerTable::new()),
                dedup,
                metrics: NetworkMetrics::new(),
                events: EventBus::new(),
                running: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Listen on the configured port and start the inbound, heartbeat and
    /// cleanup loops.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        self.inner.transport.listen(self.inner.config.port).await?;
        let events = self
            .inner
            .transport
            .take_events()
            .ok_or(NetworkError::Transport(TransportError::Closed))?;

        if let Some(address) = self.inner.transport.local_address() {
            self.inner.local_node.write().endpoint = Some(address);
        }
        self.inner.running.store(true, Ordering::SeqCst);

        {
            let mut tasks = self.inner.tasks.lock();
            tasks.push(tokio::spawn(self.clone().run_inbound(events)));
            tasks.push(tokio::spawn(self.clone().run_heartbeats()));
            tasks.push(tokio::spawn(self.clone().run_cleanup()));
        }

        info!(
            target: "gossip",
            node_id = %self.node_id(),
            endpoint = ?self.inner.local_node.read().endpoint,
            "gossip network started"
        );
        Ok(())
    }

    /// Stop all loops and close the transport. In-flight operations fail with
    /// a closed-transport error.
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        self.inner.transport.close().await?;

        let dropped = self.inner.peers.write().drain_links();
        for link in dropped {
            self.inner.metrics.record_connection_closed();
            if let Some(node) = link.node {
                self.inner
                    .events
                    .publish(NetworkEvent::PeerDisconnected { node_id: node.id });
            }
        }

        info!(target: "gossip", node_id = %self.node_id(), "gossip network stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn node_id(&self) -> &str {
        self.inner.identity.node_id()
    }

    pub fn identity(&self) -> &Arc<NodeIdentity> {
        &self.inner.identity
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    /// Current descriptor of this node, as sent in handshakes.
    pub fn local_node(&self) -> FederationNode {
        self.inner.local_node.read().clone()
    }

    /// Build and sign a message from this node.
    pub fn create_message<R: Into<String>>(
        &self,
        message_type: MessageType,
        payload: Value,
        recipient: R,
    ) -> Message {
        self.inner
            .identity
            .create_message(message_type, payload, recipient)
    }

    pub fn subscribe(&self) -> Subscription<NetworkEvent> {
        self.inner.events.subscribe()
    }

    /// Open a link to `address` and send the handshake. The peer counts as
    /// connected once its handshake comes back.
    pub async fn connect(&self, address: &str) -> Result<String> {
        if !self.is_running() {
            return Err(NetworkError::NotStarted);
        }
        self.ensure_capacity()?;

        let link_id = match self
            .inner
            .transport
            .connect(address, self.inner.config.connect_timeout)
            .await
        {
            Ok(link_id) => link_id,
            Err(err) => {
                self.inner.metrics.record_connection_failed();
                debug!(target: "gossip", address, error = %err, "connect failed");
                return Err(err.into());
            }
        };

        self.inner
            .peers
            .write()
            .insert_pending(PeerConnection::outbound(link_id.clone(), address));
        self.inner.metrics.record_connection_opened();

        if let Err(err) = self.send_handshake(&link_id).await {
            self.inner.metrics.record_connection_failed();
            self.close_link(&link_id).await;
            return Err(err);
        }

        debug!(target: "gossip", address, link = %link_id, "handshake sent");
        Ok(link_id)
    }

    /// Close the link to a connected node.
    pub async fn disconnect(&self, node_id: &str) -> Result<()> {
        let link_id = self
            .inner
            .peers
            .read()
            .connected(node_id)
            .map(|link| link.transport_id.clone())
            .ok_or_else(|| NetworkError::PeerNotConnected(node_id.to_string()))?;
        self.close_link(&link_id).await;
        Ok(())
    }

    /// Send `message` to one connected node.
    pub async fn send(&self, node_id: &str, message: &Message) -> Result<()> {
        let link_id = self
            .inner
            .peers
            .read()
            .connected(node_id)
            .map(|link| link.transport_id.clone())
            .ok_or_else(|| NetworkError::PeerNotConnected(node_id.to_string()))?;
        let bytes = message.to_bytes()?;
        self.send_frame(&link_id, bytes).await?;
        Ok(())
    }

    /// Send `message` to every connected peer. The id is marked as seen so
    /// echoes are not processed again. Individual send failures are logged and
    /// skipped; returns how many peers the message reached.
    pub async fn broadcast(&self, message: &Message) -> Result<usize> {
        if !self.is_running() {
            return Err(NetworkError::NotStarted);
        }
        self.inner.dedup.check_and_mark(&message.id);
        let bytes = message.to_bytes()?;
        Ok(self.fan_out(&bytes, None).await)
    }

    /// Descriptors of peers whose handshake has completed.
    pub fn connected_peers(&self) -> Vec<FederationNode> {
        self.inner
            .peers
            .read()
            .connected_links()
            .filter_map(|link| link.node.clone())
            .collect()
    }

    pub fn connected_peer_count(&self) -> usize {
        self.inner.peers.read().connected_count()
    }

    /// Snapshot of every connected link.
    pub fn connected_links(&self) -> Vec<PeerConnection> {
        self.inner.peers.read().connected_links().cloned().collect()
    }

    pub fn is_connected_to(&self, node_id: &str) -> bool {
        self.inner.peers.read().connected(node_id).is_some()
    }

    /// Whether any link, pending or connected, leads to `address`.
    pub fn has_link_to(&self, address: &str) -> bool {
        self.inner
            .peers
            .read()
            .all_links()
            .any(|link| link.reachable_address().as_deref() == Some(address))
    }

    /// Descriptor of a node learned from a handshake, or of this node.
    pub fn known_node(&self, node_id: &str) -> Option<FederationNode> {
        if node_id == self.node_id() {
            return Some(self.local_node());
        }
        self.inner.peers.read().known_node(node_id).cloned()
    }

    /// Apply `update` to a node's descriptor. Returns false for unknown nodes.
    pub fn update_node<F: Fn(&mut FederationNode)>(&self, node_id: &str, update: F) -> bool {
        if node_id == self.node_id() {
            update(&mut *self.inner.local_node.write());
            return true;
        }
        self.inner.peers.write().update_node(node_id, update)
    }

    pub fn metrics(&self) -> NetworkMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn health(&self) -> NetworkHealth {
        let peers = self.inner.peers.read();
        NetworkHealth {
            running: self.is_running(),
            connected_peers: peers.connected_count(),
            connecting_peers: peers.connecting_count(),
            known_nodes: peers.known_count(),
            max_peers: self.inner.config.max_peers,
            avg_latency_ms: self.inner.metrics.snapshot().avg_latency_ms,
        }
    }

    /// Disconnect links that missed the staleness window, including links
    /// that never completed a handshake. Returns how many were evicted.
    pub async fn evict_stale_peers(&self) -> usize {
        let stale = self
            .inner
            .peers
            .read()
            .stale_links(Instant::now(), self.inner.config.stale_window());

        for link_id in &stale {
            warn!(target: "gossip", link = %link_id, "evicting stale peer");
            self.inner.metrics.record_peer_evicted();
            self.close_link(link_id).await;
        }
        stale.len()
    }

    /// Send a heartbeat to every connected peer.
    pub async fn send_heartbeats(&self) {
        let targets: Vec<(String, String)> = self
            .inner
            .peers
            .read()
            .connected_links()
            .filter_map(|link| {
                link.node_id()
                    .map(|id| (link.transport_id.clone(), id.to_string()))
            })
            .collect();

        for (link_id, node_id) in targets {
            if let Err(err) = self.send_heartbeat(&link_id, node_id).await {
                debug!(target: "gossip", link = %link_id, error = %err, "heartbeat failed");
            }
        }
    }

    async fn send_heartbeat(&self, link_id: &str, node_id: String) -> Result<()> {
        let payload = serde_json::to_value(HeartbeatPayload {
            sent_at_ms: Utc::now().timestamp_millis(),
        })?;
        let message = self.create_message(MessageType::Heartbeat, payload, node_id);
        self.send_frame(link_id, message.to_bytes()?).await?;
        Ok(())
    }

    fn ensure_capacity(&self) -> Result<()> {
        let max_peers = self.inner.config.max_peers;
        if self.inner.peers.read().len() >= max_peers {
            self.inner.metrics.record_connection_rejected();
            return Err(NetworkError::MaxPeersReached(max_peers));
        }
        Ok(())
    }

    async fn run_inbound(self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connection { peer_id } => self.on_inbound_link(peer_id).await,
                TransportEvent::Message { peer_id, data } => self.on_frame(&peer_id, data).await,
                TransportEvent::Disconnect { peer_id } => self.forget_link(&peer_id),
            }
        }
        debug!(target: "gossip", node_id = %self.node_id(), "transport event stream ended");
    }

    async fn run_heartbeats(self) {
        let period = self.inner.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.send_heartbeats().await;
        }
    }

    async fn run_cleanup(self) {
        let period = self.inner.config.cleanup_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = self.evict_stale_peers().await;
            if evicted > 0 {
                debug!(target: "gossip", evicted, "cleanup pass");
            }
        }
    }

    async fn on_inbound_link(&self, link_id: String) {
        if self.ensure_capacity().is_err() {
            warn!(target: "gossip", link = %link_id, "peer limit reached, refusing inbound link");
            if let Err(err) = self.inner.transport.disconnect(&link_id).await {
                warn!(target: "gossip", link = %link_id, error = %err, "failed to refuse inbound link");
            }
            return;
        }
        self.inner
            .peers
            .write()
            .insert_pending(PeerConnection::inbound(link_id.clone()));
        self.inner.metrics.record_connection_opened();
        debug!(target: "gossip", link = %link_id, "inbound link opened");
    }

    async fn on_frame(&self, link_id: &str, data: Vec<u8>) {
        self.inner.metrics.record_message_received(data.len());

        let message = match Message::from_bytes(&data) {
            Ok(message) => message,
            Err(err) => {
                self.report_malformed(link_id, format!("malformed message: {err}"));
                return;
            }
        };

        let from = {
            let mut peers = self.inner.peers.write();
            let Some(link) = peers.by_transport_mut(link_id) else {
                self.inner.metrics.record_message_dropped();
                debug!(target: "gossip", link = %link_id, "frame on unknown link");
                return;
            };
            link.last_message_at = Instant::now();
            link.node_id().map(str::to_string)
        };

        match (message.message_type, from) {
            (MessageType::Handshake, _) => self.on_handshake(link_id, message).await,
            (MessageType::Heartbeat, Some(from)) => self.on_heartbeat(link_id, &from, &message),
            (_, Some(from)) => self.on_gossip(&from, message).await,
            (_, None) => {
                self.inner.metrics.record_message_dropped();
                debug!(
                    target: "gossip",
                    link = %link_id,
                    message_type = %message.message_type,
                    "message before handshake dropped"
                );
            }
        }
    }

    async fn on_handshake(&self, link_id: &str, message: Message) {
        let payload: HandshakePayload = match message.decode_payload() {
            Ok(payload) => payload,
            Err(err) => {
                self.report_malformed(link_id, format!("malformed handshake: {err}"));
                return;
            }
        };
        let node = payload.node;

        if message.sender_id != node.id || !verify_message_signature(&message, &node.public_key) {
            self.inner.metrics.record_invalid_signature();
            warn!(target: "gossip", link = %link_id, claimed = %node.id, "unauthenticated handshake");
            self.close_link(link_id).await;
            return;
        }

        if node.id == self.node_id() {
            debug!(target: "gossip", link = %link_id, "closing link to self");
            self.close_link(link_id).await;
            return;
        }

        let latency = u64::try_from(Utc::now().timestamp_millis() - payload.sent_at_ms)
            .ok()
            .map(Duration::from_millis);

        let inbound = match self.inner.peers.read().by_transport(link_id) {
            Some(link) if link.is_connected() => {
                debug!(target: "gossip", link = %link_id, "repeated handshake ignored");
                return;
            }
            Some(link) => link.inbound,
            None => return,
        };

        let promoted = self
            .inner
            .peers
            .write()
            .promote(link_id, node.clone(), latency)
            .map(|link| link.reachable_address());
        let address = match promoted {
            Ok(address) => address,
            Err(PromoteError::UnknownLink) => return,
            Err(PromoteError::Duplicate {
                existing_transport_id,
            }) => {
                if !self.prefers_new_link(inbound, &node.id) {
                    debug!(target: "gossip", link = %link_id, peer = %node.id, "duplicate link closed");
                    self.close_link(link_id).await;
                    return;
                }
                debug!(
                    target: "gossip",
                    link = %link_id,
                    replaced = %existing_transport_id,
                    peer = %node.id,
                    "duplicate link replaces existing one"
                );
                self.replace_link(&existing_transport_id).await;
                match self.inner.peers.write().promote(link_id, node.clone(), latency) {
                    Ok(link) => link.reachable_address(),
                    Err(_) => return,
                }
            }
        };

        if let Some(latency) = latency {
            self.inner.metrics.record_latency(latency);
        }
        if inbound {
            if let Err(err) = self.send_handshake(link_id).await {
                warn!(target: "gossip", link = %link_id, error = %err, "handshake reply failed");
            }
        }
        info!(
            target: "gossip",
            peer = %node.id,
            region = %node.region,
            inbound,
            "peer connected"
        );
        self.inner
            .events
            .publish(NetworkEvent::PeerConnected { node, address });
    }

    /// When two nodes dial each other at once both ends keep the link dialled
    /// by the node with the smaller id.
    fn prefers_new_link(&self, inbound: bool, peer_id: &str) -> bool {
        let dialer = if inbound { peer_id } else { self.node_id() };
        let preferred = std::cmp::min(peer_id, self.node_id());
        dialer == preferred
    }

    /// Drop a superseded link without announcing a disconnect.
    async fn replace_link(&self, link_id: &str) {
        if self.inner.peers.write().remove_by_transport(link_id).is_some() {
            self.inner.metrics.record_connection_closed();
        }
        if let Err(err) = self.inner.transport.disconnect(link_id).await {
            debug!(target: "gossip", link = %link_id, error = %err, "disconnect failed");
        }
    }

    fn on_heartbeat(&self, link_id: &str, from: &str, message: &Message) {
        let mut peers = self.inner.peers.write();
        let Some(link) = peers.by_transport_mut(link_id) else {
            return;
        };
        let authentic = message.sender_id == from
            && link
                .node
                .as_ref()
                .is_some_and(|node| verify_message_signature(message, &node.public_key));
        if authentic {
            link.last_heartbeat_at = Instant::now();
        } else {
            self.inner.metrics.record_invalid_signature();
            debug!(target: "gossip", link = %link_id, "heartbeat rejected");
        }
    }

    async fn on_gossip(&self, from: &str, message: Message) {
        if !self.inner.dedup.check_and_mark(&message.id) {
            self.inner.metrics.record_duplicate();
            return;
        }

        let for_us = message.is_broadcast() || message.recipient_id == self.node_id();
        if !for_us {
            self.inner.metrics.record_message_dropped();
            debug!(
                target: "gossip",
                message_id = %message.id,
                recipient = %message.recipient_id,
                "directed message for another node dropped"
            );
            return;
        }

        let relay = if message.is_broadcast() {
            message.relayed()
        } else {
            None
        };

        self.inner.events.publish(NetworkEvent::MessageReceived {
            message,
            from: from.to_string(),
        });

        if let Some(next) = relay {
            match next.to_bytes() {
                Ok(bytes) => {
                    let relayed = self.fan_out(&bytes, Some(from)).await;
                    for _ in 0..relayed {
                        self.inner.metrics.record_message_relayed();
                    }
                }
                Err(err) => warn!(target: "gossip", error = %err, "failed to encode relay"),
            }
        }
    }

    /// Send to every connected link except the one to `exclude`.
    async fn fan_out(&self, bytes: &[u8], exclude: Option<&str>) -> usize {
        let targets: Vec<String> = self
            .inner
            .peers
            .read()
            .connected_links()
            .filter(|link| exclude.is_none() || link.node_id() != exclude)
            .map(|link| link.transport_id.clone())
            .collect();

        let mut delivered = 0;
        for link_id in targets {
            match self.send_frame(&link_id, bytes.to_vec()).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(target: "gossip", link = %link_id, error = %err, "gossip send failed");
                }
            }
        }
        delivered
    }

    async fn send_handshake(&self, link_id: &str) -> Result<()> {
        let payload = serde_json::to_value(HandshakePayload {
            node: self.local_node(),
            sent_at_ms: Utc::now().timestamp_millis(),
        })?;
        let mut message = self
            .inner
            .identity
            .create_message(MessageType::Handshake, payload, BROADCAST);
        message.ttl = None;
        self.send_frame(link_id, message.to_bytes()?).await?;
        Ok(())
    }

    async fn send_frame(
        &self,
        link_id: &str,
        bytes: Vec<u8>,
    ) -> std::result::Result<(), TransportError> {
        let len = bytes.len();
        match self.inner.transport.send(link_id, bytes).await {
            Ok(()) => {
                self.inner.metrics.record_message_sent(len);
                Ok(())
            }
            Err(err) => {
                self.inner.metrics.record_message_failed();
                if matches!(err, TransportError::UnknownPeer(_)) {
                    self.forget_link(link_id);
                }
                Err(err)
            }
        }
    }

    /// Close a link at the transport and drop its record.
    async fn close_link(&self, link_id: &str) {
        if let Err(err) = self.inner.transport.disconnect(link_id).await {
            debug!(target: "gossip", link = %link_id, error = %err, "disconnect failed");
        }
        self.forget_link(link_id);
    }

    fn forget_link(&self, link_id: &str) {
        let removed = self.inner.peers.write().remove_by_transport(link_id);
        let Some(link) = removed else {
            return;
        };
        self.inner.metrics.record_connection_closed();
        if let Some(node) = link.node {
            info!(target: "gossip", peer = %node.id, "peer disconnected");
            self.inner
                .events
                .publish(NetworkEvent::PeerDisconnected { node_id: node.id });
        }
    }

    fn report_malformed(&self, link_id: &str, reason: String) {
        self.inner.metrics.record_message_dropped();
        warn!(target: "gossip", link = %link_id, %reason, "dropping inbound frame");
        self.inner.events.publish(NetworkEvent::NetworkError {
            peer_id: Some(link_id.to_string()),
            reason,
        });
    }
}
