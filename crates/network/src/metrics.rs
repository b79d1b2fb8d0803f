use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Gossip network counters
#[derive(Debug)]
pub struct NetworkMetrics {
    // Message counters
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_relayed: AtomicU64,
    messages_failed: AtomicU64,
    messages_dropped: AtomicU64,
    duplicates_ignored: AtomicU64,
    invalid_signatures: AtomicU64,

    // Byte counters
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,

    // Connection counters
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    connections_failed: AtomicU64,
    connections_rejected: AtomicU64,
    peers_evicted: AtomicU64,

    start_time: Instant,

    // Latency tracking (sum, samples, max) in milliseconds
    latency: Mutex<(f64, u64, u64)>,
}

impl NetworkMetrics {
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_relayed: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            duplicates_ignored: AtomicU64::new(0),
            invalid_signatures: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            connections_failed: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            peers_evicted: AtomicU64::new(0),
            start_time: Instant::now(),
            latency: Mutex::new((0.0, 0, 0)),
        }
    }

    pub fn record_message_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_message_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_message_relayed(&self) {
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Malformed, misaddressed or unauthenticated inbound message
    pub fn record_message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_signature(&self) {
        self.invalid_signatures.fetch_add(1, Ordering::Relaxed);
        self.record_message_dropped();
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Link refused because the peer limit was reached
    pub fn record_connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_peer_evicted(&self) {
        self.peers_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        let mut latency_state = self.latency.lock();
        latency_state.0 += latency_ms as f64;
        latency_state.1 += 1;
        latency_state.2 = latency_state.2.max(latency_ms);
    }

    /// Get current network metrics snapshot
    pub fn snapshot(&self) -> NetworkMetricsSnapshot {
        let (latency_sum, latency_samples, max_latency_ms) = *self.latency.lock();
        NetworkMetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            duplicates_ignored: self.duplicates_ignored.load(Ordering::Relaxed),
            invalid_signatures: self.invalid_signatures.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            peers_evicted: self.peers_evicted.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            avg_latency_ms: if latency_samples == 0 {
                0.0
            } else {
                latency_sum / latency_samples as f64
            },
            max_latency_ms,
            latency_samples,
        }
    }
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of network metrics at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_relayed: u64,
    pub messages_failed: u64,
    pub messages_dropped: u64,
    pub duplicates_ignored: u64,
    pub invalid_signatures: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connections_failed: u64,
    pub connections_rejected: u64,
    pub peers_evicted: u64,
    pub uptime_seconds: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub latency_samples: u64,
}

impl NetworkMetricsSnapshot {
    /// Fraction of outbound sends that succeeded
    pub fn success_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_failed;
        if total == 0 {
            return 1.0;
        }
        self.messages_sent as f64 / total as f64
    }
}
