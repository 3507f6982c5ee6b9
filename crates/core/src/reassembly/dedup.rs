use std::collections::{HashSet, VecDeque};

/// Default number of sequence numbers remembered.
pub const DEDUP_CAPACITY: usize = 50;

/// Bounded history of recently seen sequence numbers.
///
/// A ring of at most `capacity` entries: when full, inserting a new number
/// forgets the oldest one. Lookups go through a hash set kept in step with
/// the ring.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<u16>,
    seen: HashSet<u16>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Record `seq`. Returns `false` if it was already in the window.
    pub fn insert(&mut self, seq: u16) -> bool {
        if !self.seen.insert(seq) {
            return false;
        }
        self.order.push_back(seq);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, seq: u16) -> bool {
        self.seen.contains(&seq)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEDUP_CAPACITY)
    }
}
