use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Default)]
struct SeenIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

/// Message deduplication cache to prevent processing duplicate messages.
///
/// Tracks message ids in arrival order. Once the cache grows past `max_size`
/// the oldest ids are dropped until half the bound remains, so a very old
/// message can be processed again after trimming.
#[derive(Debug)]
pub struct MessageDeduplicator {
    seen: Mutex<SeenIds>,
    max_size: usize,
}

impl MessageDeduplicator {
    /// Create a new message deduplicator
    pub fn new(max_size: usize) -> Self {
        Self {
            seen: Mutex::new(SeenIds::default()),
            max_size: max_size.max(1),
        }
    }

    /// Check if a message has been seen before and mark it as seen.
    /// Returns true if this is a new message, false if it's a duplicate.
    pub fn check_and_mark(&self, message_id: &str) -> bool {
        let mut seen = self.seen.lock();
        if !seen.ids.insert(message_id.to_string()) {
            return false;
        }
        seen.order.push_back(message_id.to_string());

        if seen.order.len() > self.max_size {
            let retain = self.max_size / 2;
            while seen.order.len() > retain {
                if let Some(oldest) = seen.order.pop_front() {
                    seen.ids.remove(&oldest);
                }
            }
        }
        true
    }

    /// Check if a message has been seen without marking it
    pub fn has_seen(&self, message_id: &str) -> bool {
        self.seen.lock().ids.contains(message_id)
    }

    /// Get the number of tracked messages
    pub fn size(&self) -> usize {
        self.seen.lock().order.len()
    }

    /// Clear all tracked messages
    pub fn clear(&self) {
        let mut seen = self.seen.lock();
        seen.ids.clear();
        seen.order.clear();
    }
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::new(10_000)
    }
}
