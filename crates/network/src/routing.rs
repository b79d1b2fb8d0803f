//! XOR-distance routing tables for discovery lookups.
//!
//! Node ids are hashed with SHA-256 and compared by the XOR of their hashes.
//! Two tables implement [`RoutingTable`]: the default [`HashPrefixRoutingTable`]
//! partitions entries by the first hash byte, and [`KademliaRoutingTable`]
//! buckets them by the length of the common prefix with the local hash.

use sentinel_crypto::sha256;
use std::collections::{HashMap, VecDeque};

/// Default bucket capacity.
pub const DEFAULT_K: usize = 20;

pub type NodeHash = [u8; 32];

pub fn node_hash(node_id: &str) -> NodeHash {
    sha256(node_id.as_bytes())
}

pub fn xor_distance(a: &NodeHash, b: &NodeHash) -> NodeHash {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    pub node_id: String,
    pub address: String,
    pub hash: NodeHash,
}

impl RoutingEntry {
    pub fn new<I: Into<String>, A: Into<String>>(node_id: I, address: A) -> Self {
        let node_id = node_id.into();
        let hash = node_hash(&node_id);
        Self {
            node_id,
            address: address.into(),
            hash,
        }
    }
}

/// Closest-node lookups over known `(node id, address)` pairs.
pub trait RoutingTable: Send + Sync {
    /// Insert or refresh a node. Returns the entry evicted to make room, if any.
    fn add_node(&mut self, node_id: &str, address: &str) -> Option<RoutingEntry>;

    fn remove_node(&mut self, node_id: &str) -> bool;

    /// Up to `count` entries ordered by XOR distance to the hashed target.
    fn find_closest(&self, target_id: &str, count: usize) -> Vec<RoutingEntry>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Entries in least-recently-seen order.
#[derive(Debug, Default, Clone)]
struct Bucket {
    entries: VecDeque<RoutingEntry>,
}

impl Bucket {
    fn touch(&mut self, entry: RoutingEntry, k: usize) -> Option<RoutingEntry> {
        if let Some(pos) = self.entries.iter().position(|e| e.node_id == entry.node_id) {
            self.entries.remove(pos);
            self.entries.push_back(entry);
            return None;
        }
        let evicted = if self.entries.len() >= k {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    fn remove(&mut self, node_id: &str) -> bool {
        match self.entries.iter().position(|e| e.node_id == node_id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }
}

fn closest<'a, I>(entries: I, target_id: &str, count: usize) -> Vec<RoutingEntry>
where
    I: Iterator<Item = &'a RoutingEntry>,
{
    let target = node_hash(target_id);
    let mut ranked: Vec<(NodeHash, &RoutingEntry)> = entries
        .map(|entry| (xor_distance(&entry.hash, &target), entry))
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0));
    ranked
        .into_iter()
        .take(count)
        .map(|(_, entry)| entry.clone())
        .collect()
}

/// Buckets keyed by the first byte of the node hash.
#[derive(Debug, Clone)]
pub struct HashPrefixRoutingTable {
    k: usize,
    buckets: HashMap<u8, Bucket>,
}

impl HashPrefixRoutingTable {
    pub fn new(k: usize) -> Self {
        Self {
            k: k.max(1),
            buckets: HashMap::new(),
        }
    }

    pub fn bucket_len(&self, prefix: u8) -> usize {
        self.buckets.get(&prefix).map_or(0, |b| b.entries.len())
    }
}

impl Default for HashPrefixRoutingTable {
    fn default() -> Self {
        Self::new(DEFAULT_K)
    }
}

impl RoutingTable for HashPrefixRoutingTable {
    fn add_node(&mut self, node_id: &str, address: &str) -> Option<RoutingEntry> {
        let entry = RoutingEntry::new(node_id, address);
        let k = self.k;
        self.buckets.entry(entry.hash[0]).or_default().touch(entry, k)
    }

    fn remove_node(&mut self, node_id: &str) -> bool {
        let prefix = node_hash(node_id)[0];
        let Some(bucket) = self.buckets.get_mut(&prefix) else {
            return false;
        };
        let removed = bucket.remove(node_id);
        if bucket.entries.is_empty() {
            self.buckets.remove(&prefix);
        }
        removed
    }

    fn find_closest(&self, target_id: &str, count: usize) -> Vec<RoutingEntry> {
        closest(
            self.buckets.values().flat_map(|b| b.entries.iter()),
            target_id,
            count,
        )
    }

    fn len(&self) -> usize {
        self.buckets.values().map(|b| b.entries.len()).sum()
    }
}

/// Bit-level Kademlia table: bucket `i` holds nodes whose hash shares exactly
/// `i` leading bits with the local hash.
#[derive(Debug, Clone)]
pub struct KademliaRoutingTable {
    local: NodeHash,
    k: usize,
    buckets: Vec<Bucket>,
}

impl KademliaRoutingTable {
    pub fn new(local_node_id: &str, k: usize) -> Self {
        Self {
            local: node_hash(local_node_id),
            k: k.max(1),
            buckets: vec![Bucket::default(); 256],
        }
    }

    /// `None` for the local node itself.
    pub fn bucket_index(&self, hash: &NodeHash) -> Option<usize> {
        let distance = xor_distance(&self.local, hash);
        distance
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != 0)
            .map(|(i, byte)| i * 8 + byte.leading_zeros() as usize)
    }

    pub fn bucket_len(&self, index: usize) -> usize {
        self.buckets.get(index).map_or(0, |b| b.entries.len())
    }
}

impl RoutingTable for KademliaRoutingTable {
    fn add_node(&mut self, node_id: &str, address: &str) -> Option<RoutingEntry> {
        let entry = RoutingEntry::new(node_id, address);
        let index = self.bucket_index(&entry.hash)?;
        let k = self.k;
        self.buckets[index].touch(entry, k)
    }

    fn remove_node(&mut self, node_id: &str) -> bool {
        match self.bucket_index(&node_hash(node_id)) {
            Some(index) => self.buckets[index].remove(node_id),
            None => false,
        }
    }

    fn find_closest(&self, target_id: &str, count: usize) -> Vec<RoutingEntry> {
        closest(
            self.buckets.iter().flat_map(|b| b.entries.iter()),
            target_id,
            count,
        )
    }

    fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }
}
