use sentinel_types::FederationNode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Lifecycle of one link. `Disconnected` is terminal; reconnecting creates a
/// new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Per-link state tracked by the gossip network.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    /// Transport-level link id.
    pub transport_id: String,
    pub state: ConnectionState,
    pub inbound: bool,
    /// Address dialled for outbound links.
    pub address: Option<String>,
    /// Remote descriptor, known once the handshake completes.
    pub node: Option<FederationNode>,
    pub created_at: Instant,
    pub last_message_at: Instant,
    pub last_heartbeat_at: Instant,
    pub latency: Option<Duration>,
}

impl PeerConnection {
    pub fn outbound<T: Into<String>, A: Into<String>>(transport_id: T, address: A) -> Self {
        Self::new(transport_id.into(), false, Some(address.into()))
    }

    pub fn inbound<T: Into<String>>(transport_id: T) -> Self {
        Self::new(transport_id.into(), true, None)
    }

    fn new(transport_id: String, inbound: bool, address: Option<String>) -> Self {
        let now = Instant::now();
        Self {
            transport_id,
            state: ConnectionState::Connecting,
            inbound,
            address,
            node: None,
            created_at: now,
            last_message_at: now,
            last_heartbeat_at: now,
            latency: None,
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        self.node.as_ref().map(|node| node.id.as_str())
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Address other nodes can dial to reach this peer.
    pub fn reachable_address(&self) -> Option<String> {
        self.node
            .as_ref()
            .and_then(|node| node.endpoint.clone())
            .or_else(|| self.address.clone())
    }

    /// No heartbeat (or, before the handshake, no progress) within `window`.
    pub fn is_stale(&self, now: Instant, window: Duration) -> bool {
        let reference = match self.state {
            ConnectionState::Connected => self.last_heartbeat_at,
            _ => self.created_at,
        };
        now.saturating_duration_since(reference) > window
    }
}

/// Why a link could not be promoted to `Connected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoteError {
    UnknownLink,
    /// Another link to the same node is already connected.
    Duplicate { existing_transport_id: String },
}

/// The node's single peer roster.
///
/// Links are keyed by transport id until their handshake completes and by
/// node id afterwards. Descriptors learned from authenticated handshakes are
/// remembered after the link goes away so signatures from those nodes can
/// still be checked when their messages arrive over other paths.
#[derive(Debug, Default)]
pub struct PeerTable {
    links: HashMap<String, PeerConnection>,
    by_transport: HashMap<String, String>,
    known_nodes: HashMap<String, FederationNode>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a link that has not completed its handshake yet.
    pub fn insert_pending(&mut self, connection: PeerConnection) {
        let key = connection.transport_id.clone();
        self.by_transport.insert(key.clone(), key.clone());
        self.links.insert(key, connection);
    }

    pub fn by_transport(&self, transport_id: &str) -> Option<&PeerConnection> {
        self.by_transport
            .get(transport_id)
            .and_then(|key| self.links.get(key))
    }

    pub fn by_transport_mut(&mut self, transport_id: &str) -> Option<&mut PeerConnection> {
        let key = self.by_transport.get(transport_id)?;
        self.links.get_mut(key)
    }

    /// Connected link to `node_id`, if any.
    pub fn connected(&self, node_id: &str) -> Option<&PeerConnection> {
        self.links.get(node_id).filter(|link| link.is_connected())
    }

    /// Complete a handshake: mark the link connected and re-key it by node id.
    pub fn promote(
        &mut self,
        transport_id: &str,
        node: FederationNode,
        latency: Option<Duration>,
    ) -> Result<&PeerConnection, PromoteError> {
        if let Some(existing) = self.connected(&node.id) {
            if existing.transport_id != transport_id {
                return Err(PromoteError::Duplicate {
                    existing_transport_id: existing.transport_id.clone(),
                });
            }
        }

        let key = self
            .by_transport
            .remove(transport_id)
            .ok_or(PromoteError::UnknownLink)?;
        let mut link = self.links.remove(&key).ok_or(PromoteError::UnknownLink)?;

        let now = Instant::now();
        link.state = ConnectionState::Connected;
        link.last_heartbeat_at = now;
        link.last_message_at = now;
        link.latency = latency;
        link.node = Some(node.clone());

        let node_id = node.id.clone();
        self.known_nodes.insert(node_id.clone(), node);
        self.by_transport
            .insert(transport_id.to_string(), node_id.clone());
        self.links.insert(node_id.clone(), link);
        self.links.get(&node_id).ok_or(PromoteError::UnknownLink)
    }

    /// Forget a link. The returned record is marked `Disconnected`.
    pub fn remove_by_transport(&mut self, transport_id: &str) -> Option<PeerConnection> {
        let key = self.by_transport.remove(transport_id)?;
        let mut link = self.links.remove(&key)?;
        link.state = ConnectionState::Disconnected;
        Some(link)
    }

    /// Every link, connecting or connected.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn connected_links(&self) -> impl Iterator<Item = &PeerConnection> {
        self.links.values().filter(|link| link.is_connected())
    }

    pub fn connected_count(&self) -> usize {
        self.connected_links().count()
    }

    pub fn connecting_count(&self) -> usize {
        self.links
            .values()
            .filter(|link| link.state == ConnectionState::Connecting)
            .count()
    }

    pub fn all_links(&self) -> impl Iterator<Item = &PeerConnection> {
        self.links.values()
    }

    /// Transport ids of links that missed the staleness window.
    pub fn stale_links(&self, now: Instant, window: Duration) -> Vec<String> {
        self.links
            .values()
            .filter(|link| link.is_stale(now, window))
            .map(|link| link.transport_id.clone())
            .collect()
    }

    pub fn known_node(&self, node_id: &str) -> Option<&FederationNode> {
        self.known_nodes.get(node_id)
    }

    pub fn known_count(&self) -> usize {
        self.known_nodes.len()
    }

    /// Drop every link, returning the removed records.
    pub fn drain_links(&mut self) -> Vec<PeerConnection> {
        self.by_transport.clear();
        self.links
            .drain()
            .map(|(_, mut link)| {
                link.state = ConnectionState::Disconnected;
                link
            })
            .collect()
    }

    /// Apply `update` to the stored descriptor of `node_id`, including the copy
    /// held by its live link.
    pub fn update_node<F: Fn(&mut FederationNode)>(&mut self, node_id: &str, update: F) -> bool {
        let Some(node) = self.known_nodes.get_mut(node_id) else {
            return false;
        };
        update(node);
        if let Some(link_node) = self.links.get_mut(node_id).and_then(|l| l.node.as_mut()) {
            update(link_node);
        }
        true
    }
}
