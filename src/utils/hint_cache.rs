//! Small, explicitly-scoped key-value side cache for recent counterparty
//! hits. TTL-free and bounded; never a source of truth. Callers must
//! re-validate every hint against the ledger store before acting on it.

use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Bounded insertion-ordered cache mapping normalized names to counterparty
/// ids. The oldest entry is evicted when the capacity is reached.
#[derive(Debug, Clone)]
pub struct HintCache {
    capacity: usize,
    entries: HashMap<String, Uuid>,
    order: VecDeque<String>,
}

impl HintCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Remember a resolved name
    pub fn note(&mut self, key: &str, id: Uuid) {
        if self.entries.insert(key.to_string(), id).is_none() {
            self.order.push_back(key.to_string());
            if self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }

    /// Look up a hint; the caller must re-validate the result
    pub fn hint(&self, key: &str) -> Option<Uuid> {
        self.entries.get(key).copied()
    }

    /// Drop a stale entry
    pub fn forget(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
