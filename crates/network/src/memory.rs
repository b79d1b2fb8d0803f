//! In-process transport for tests and simulations.
//!
//! Every [`MemoryTransport`] belongs to a [`MemoryHub`] owned by the caller.
//! Hubs are ordinary values, so independent simulated networks can coexist in
//! one process without sharing any state.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;
use crate::transport::{Transport, TransportEvent};

const EPHEMERAL_ADDRESS: &str = "mem://ephemeral";

/// Registry of listening in-process endpoints.
#[derive(Debug, Default)]
pub struct MemoryHub {
    listeners: Mutex<HashMap<String, Weak<MemoryEndpoint>>>,
    next_link: AtomicU64,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport attached to this hub.
    pub fn transport(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport::new(self.clone())
    }

    /// Address a transport listening on `port` is reachable at.
    pub fn address_for(port: u16) -> String {
        format!("mem://{port}")
    }

    /// Number of endpoints currently accepting links.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .values()
            .filter(|endpoint| endpoint.strong_count() > 0)
            .count()
    }

    fn lookup(&self, address: &str) -> Option<Arc<MemoryEndpoint>> {
        self.listeners.lock().get(address).and_then(Weak::upgrade)
    }
}

#[derive(Debug)]
struct RemoteLink {
    endpoint: Weak<MemoryEndpoint>,
    remote_link_id: String,
}

#[derive(Debug)]
struct MemoryEndpoint {
    events: mpsc::UnboundedSender<TransportEvent>,
    links: Mutex<HashMap<String, RemoteLink>>,
    closed: AtomicBool,
}

impl MemoryEndpoint {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: TransportEvent) -> bool {
        !self.is_closed() && self.events.send(event).is_ok()
    }

    /// Drop the local half of a link and tell the owner about it.
    fn drop_link(&self, link_id: &str) {
        if self.links.lock().remove(link_id).is_some() {
            self.emit(TransportEvent::Disconnect {
                peer_id: link_id.to_string(),
            });
        }
    }
}

/// Transport endpoint whose frames travel over in-process channels.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    endpoint: Arc<MemoryEndpoint>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    address: RwLock<Option<String>>,
}

impl MemoryTransport {
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        Self {
            hub,
            endpoint: Arc::new(MemoryEndpoint {
                events,
                links: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
            receiver: Mutex::new(Some(receiver)),
            address: RwLock::new(None),
        }
    }

    /// Number of open links.
    pub fn link_count(&self) -> usize {
        self.endpoint.links.lock().len()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.endpoint.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn open_link(&self, address: &str) -> Result<String, TransportError> {
        let remote = self
            .hub
            .lookup(address)
            .filter(|endpoint| !endpoint.is_closed())
            .ok_or_else(|| TransportError::ConnectionRefused(address.to_string()))?;

        let link = self.hub.next_link.fetch_add(1, Ordering::SeqCst);
        let local_address = self
            .address
            .read()
            .clone()
            .unwrap_or_else(|| EPHEMERAL_ADDRESS.to_string());
        let local_id = format!("{address}#{link}");
        let remote_id = format!("{local_address}#{link}");

        self.endpoint.links.lock().insert(
            local_id.clone(),
            RemoteLink {
                endpoint: Arc::downgrade(&remote),
                remote_link_id: remote_id.clone(),
            },
        );
        remote.links.lock().insert(
            remote_id.clone(),
            RemoteLink {
                endpoint: Arc::downgrade(&self.endpoint),
                remote_link_id: local_id.clone(),
            },
        );

        if !remote.emit(TransportEvent::Connection { peer_id: remote_id }) {
            self.endpoint.links.lock().remove(&local_id);
            return Err(TransportError::ConnectionRefused(address.to_string()));
        }

        debug!(target: "memory_transport", link = %local_id, "link opened");
        Ok(local_id)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, port: u16) -> Result<(), TransportError> {
        self.ensure_open()?;
        let address = MemoryHub::address_for(port);
        {
            let mut listeners = self.hub.listeners.lock();
            if listeners
                .get(&address)
                .and_then(Weak::upgrade)
                .is_some_and(|existing| !existing.is_closed())
            {
                return Err(TransportError::AddressInUse(address));
            }
            listeners.insert(address.clone(), Arc::downgrade(&self.endpoint));
        }
        *self.address.write() = Some(address);
        Ok(())
    }

    async fn connect(&self, address: &str, timeout: Duration) -> Result<String, TransportError> {
        self.ensure_open()?;
        tokio::time::timeout(timeout, async { self.open_link(address) })
            .await
            .map_err(|_| TransportError::Timeout(address.to_string()))?
    }

    async fn send(&self, peer_id: &str, data: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_open()?;
        let (remote, remote_link_id) = {
            let links = self.endpoint.links.lock();
            let link = links
                .get(peer_id)
                .ok_or_else(|| TransportError::UnknownPeer(peer_id.to_string()))?;
            (link.endpoint.upgrade(), link.remote_link_id.clone())
        };

        let delivered = remote.is_some_and(|remote| {
            remote.emit(TransportEvent::Message {
                peer_id: remote_link_id,
                data,
            })
        });

        if delivered {
            Ok(())
        } else {
            self.endpoint.drop_link(peer_id);
            Err(TransportError::UnknownPeer(peer_id.to_string()))
        }
    }

    async fn disconnect(&self, peer_id: &str) -> Result<(), TransportError> {
        let link = self
            .endpoint
            .links
            .lock()
            .remove(peer_id)
            .ok_or_else(|| TransportError::UnknownPeer(peer_id.to_string()))?;

        if let Some(remote) = link.endpoint.upgrade() {
            remote.drop_link(&link.remote_link_id);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.endpoint.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(address) = self.address.read().clone() {
            let mut listeners = self.hub.listeners.lock();
            let ours = listeners
                .get(&address)
                .is_some_and(|endpoint| Weak::ptr_eq(endpoint, &Arc::downgrade(&self.endpoint)));
            if ours {
                listeners.remove(&address);
            }
        }

        let links: Vec<RemoteLink> = self.endpoint.links.lock().drain().map(|(_, l)| l).collect();
        for link in links {
            if let Some(remote) = link.endpoint.upgrade() {
                remote.drop_link(&link.remote_link_id);
            }
        }
        Ok(())
    }

    fn local_address(&self) -> Option<String> {
        self.address.read().clone()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.receiver.lock().take()
    }
}
