use std::collections::{HashSet, VecDeque};

/// Identity of one delivery of one row mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupeKey {
    pub table: String,
    pub row_id: String,
    pub commit_id: String,
}

/// Bounded memory of recently seen mutation keys. The oldest key is
/// forgotten once `capacity` is exceeded.
#[derive(Debug)]
pub struct DedupeWindow {
    capacity: usize,
    seen: HashSet<DedupeKey>,
    order: VecDeque<DedupeKey>,
}

impl DedupeWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, seen: HashSet::new(), order: VecDeque::new() }
    }

    /// Records `key`. Returns false when it was already inside the window.
    pub fn check_and_insert(&mut self, key: DedupeKey) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    /// Drops `key` so a redelivery of that mutation is processed again.
    pub fn forget(&mut self, key: &DedupeKey) -> bool {
        if !self.seen.remove(key) {
            return false;
        }
        self.order.retain(|kept| kept != key);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}
