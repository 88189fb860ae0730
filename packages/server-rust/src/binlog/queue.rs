use std::cmp::Reverse;
use std::collections::BinaryHeap;

use parking_lot::Mutex;

/// fromIds inserted since the last binlog flush, smallest first.
#[derive(Debug, Default)]
pub struct DurabilityQueue {
    heap: Mutex<BinaryHeap<Reverse<String>>>,
}

impl DurabilityQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, from_id: &str) {
        self.heap.lock().push(Reverse(from_id.to_string()));
    }

    /// Pops up to `max` ids in ascending order.
    pub fn pop_chunk(&self, max: usize) -> Vec<String> {
        let mut heap = self.heap.lock();
        let mut chunk = Vec::with_capacity(max.min(heap.len()));
        while chunk.len() < max {
            match heap.pop() {
                Some(Reverse(id)) => chunk.push(id),
                None => break,
            }
        }
        chunk
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}
