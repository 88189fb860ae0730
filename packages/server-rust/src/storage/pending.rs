//! Staging state between promotion and storage.
//!
//! [`PendingBuffers`] holds associations promoted out of the expiry queue and
//! waiting for the next persistence cycle. [`DelayedPurge`] holds fromIds
//! that were handed to storage and leave the hot cache once their due time
//! passes.

use std::collections::BTreeMap;

use dashmap::DashMap;
use parking_lot::Mutex;

/// Forward and reverse staging maps.
#[derive(Debug, Default)]
pub struct PendingBuffers {
    forward: DashMap<String, String>,
    reverse: DashMap<String, String>,
}

/// Point-in-time copy of both pending maps.
#[derive(Debug, Default, Clone)]
pub struct PendingSnapshot {
    /// `(from_id, to_id)` pairs from the forward map.
    pub forward: Vec<(String, String)>,
    /// `(to_id, from_id)` pairs from the reverse map.
    pub reverse: Vec<(String, String)>,
}

impl PendingSnapshot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty() && self.reverse.is_empty()
    }
}

impl PendingBuffers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts the association into both maps.
    pub fn stage(&self, from_id: &str, to_id: &str) {
        self.forward.insert(from_id.to_string(), to_id.to_string());
        self.reverse.insert(to_id.to_string(), from_id.to_string());
    }

    pub fn remove_forward(&self, from_id: &str) -> Option<String> {
        self.forward.remove(from_id).map(|(_, v)| v)
    }

    pub fn remove_reverse(&self, to_id: &str) -> Option<String> {
        self.reverse.remove(to_id).map(|(_, v)| v)
    }

    #[must_use]
    pub fn snapshot(&self) -> PendingSnapshot {
        PendingSnapshot {
            forward: self
                .forward
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            reverse: self
                .reverse
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }

    /// Removes every snapshotted entry that still holds its snapshotted value.
    ///
    /// An entry re-staged with a different value after the snapshot was taken
    /// stays for the next cycle.
    pub fn settle(&self, snapshot: &PendingSnapshot) {
        for (key, value) in &snapshot.forward {
            self.forward.remove_if(key, |_, v| v == value);
        }
        for (key, value) in &snapshot.reverse {
            self.reverse.remove_if(key, |_, v| v == value);
        }
    }

    #[must_use]
    pub fn forward_len(&self) -> usize {
        self.forward.len()
    }

    #[must_use]
    pub fn reverse_len(&self) -> usize {
        self.reverse.len()
    }

    #[must_use]
    pub fn contains_forward(&self, from_id: &str) -> bool {
        self.forward.contains_key(from_id)
    }

    #[must_use]
    pub fn contains_reverse(&self, to_id: &str) -> bool {
        self.reverse.contains_key(to_id)
    }
}

/// fromIds awaiting removal from the hot cache, keyed by due time in epoch
/// milliseconds.
#[derive(Debug, Default)]
pub struct DelayedPurge {
    due: Mutex<BTreeMap<u64, Vec<String>>>,
}

impl DelayedPurge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `ids` for purge at `due_at`.
    pub fn schedule<I>(&self, due_at: u64, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut ids = ids.into_iter().peekable();
        if ids.peek().is_none() {
            return;
        }
        self.due.lock().entry(due_at).or_default().extend(ids);
    }

    /// Removes and returns every id whose due time is strictly before `now`.
    pub fn take_due(&self, now: u64) -> Vec<String> {
        let mut due = self.due.lock();
        let later = due.split_off(&now);
        let expired = std::mem::replace(&mut *due, later);
        expired.into_values().flatten().collect()
    }

    /// Total ids scheduled.
    #[must_use]
    pub fn len(&self) -> usize {
        self.due.lock().values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.due.lock().is_empty()
    }
}
