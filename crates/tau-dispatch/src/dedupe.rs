//! Bounded FIFO tracker of inbound event keys seen recently.
use std::collections::{HashSet, VecDeque};

pub const DEFAULT_DEDUPE_CAPACITY: usize = 2_000;

#[derive(Debug, Clone)]
/// Public struct `InboundDedupeTracker` used across Tau components.
pub struct InboundDedupeTracker {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl Default for InboundDedupeTracker {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUPE_CAPACITY)
    }
}

impl InboundDedupeTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Records `key`; returns false when it was already tracked.
    pub fn check_and_record(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        self.order.push_back(key.to_string());
        self.seen.insert(key.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
