use std::collections::{HashSet, VecDeque};

use crate::types::MessageId;

pub const DEFAULT_DELIVERED_CAPACITY: usize = 100;

/// Bounded FIFO set of recently delivered message ids.
#[derive(Debug)]
pub struct DeliveredIdCache {
    capacity: usize,
    order: VecDeque<MessageId>,
    ids: HashSet<MessageId>,
}

impl DeliveredIdCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
        }
    }

    /// Records `id`, evicting the oldest entry when full.
    ///
    /// Returns false if the id was already present.
    pub fn record(&mut self, id: &MessageId) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.clone());
        self.ids.insert(id.clone());
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DeliveredIdCache {
    fn default() -> Self {
        Self::new(DEFAULT_DELIVERED_CAPACITY)
    }
}
