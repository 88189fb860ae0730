//! Parity-rotated delete-request buckets.
//!
//! Producers add to the bucket of the current second's parity; each
//! persistence cycle drains one bucket, alternating between cycles. After a
//! drain only the ids it actually
//! processed are removed, so an id added to the drained bucket mid-drain is
//! picked up next time rather than lost.

use dashmap::DashSet;
use idmap_core::Direction;

/// Two sets per direction, indexed by `epoch_seconds % 2`.
#[derive(Debug, Default)]
pub struct DeleteBuckets {
    forward: [DashSet<String>; 2],
    reverse: [DashSet<String>; 2],
}

impl DeleteBuckets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, direction: Direction, parity: usize) -> &DashSet<String> {
        let sets = match direction {
            Direction::Forward => &self.forward,
            Direction::Reverse => &self.reverse,
        };
        &sets[parity % 2]
    }

    /// Records a delete request for `id` in the bucket for `parity`.
    pub fn add(&self, direction: Direction, parity: usize, id: &str) {
        self.bucket(direction, parity).insert(id.to_string());
    }

    /// Copies the ids currently in one bucket, sorted.
    #[must_use]
    pub fn snapshot(&self, direction: Direction, parity: usize) -> Vec<String> {
        let mut ids: Vec<String> = self
            .bucket(direction, parity)
            .iter()
            .map(|id| id.key().clone())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Removes processed ids from one bucket.
    pub fn clear_processed(&self, direction: Direction, parity: usize, ids: &[String]) {
        let bucket = self.bucket(direction, parity);
        for id in ids {
            bucket.remove(id);
        }
    }

    #[must_use]
    pub fn len(&self, direction: Direction, parity: usize) -> usize {
        self.bucket(direction, parity).len()
    }

    /// Total ids across every bucket.
    #[must_use]
    pub fn total(&self) -> usize {
        self.forward.iter().chain(&self.reverse).map(DashSet::len).sum()
    }
}
