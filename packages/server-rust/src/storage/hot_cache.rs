//! In-memory bidirectional association cache backed by [`DashMap`].
//!
//! Request handlers read and write the two maps directly without external
//! locking: every operation touches a single key and `put` is last-write-wins.

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

/// Forward (`from -> to`) and reverse (`to -> from`) maps plus the capacity
/// watchdog.
///
/// The two directions are removed independently: deleting a `from_id` does
/// not retract the `to_id -> from_id` entry.
#[derive(Debug)]
pub struct HotCache {
    forward: DashMap<String, String>,
    reverse: DashMap<String, String>,
    limit: usize,
    force_flush: AtomicBool,
}

impl HotCache {
    /// Creates an empty cache whose watchdog fires at `limit` reverse entries.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            forward: DashMap::new(),
            reverse: DashMap::new(),
            limit,
            force_flush: AtomicBool::new(false),
        }
    }

    /// Upserts both directions and runs the capacity watchdog.
    ///
    /// Re-mapping `from_id` drops the reverse entry of its previous `to_id`
    /// if that entry still points back at `from_id`.
    ///
    /// Returns `true` if this put left the reverse map at or above the limit.
    pub fn put(&self, from_id: &str, to_id: &str) -> bool {
        if let Some(previous) = self.forward.insert(from_id.to_string(), to_id.to_string()) {
            if previous != to_id {
                self.reverse.remove_if(&previous, |_, owner| owner == from_id);
            }
        }
        self.reverse.insert(to_id.to_string(), from_id.to_string());
        let over = self.reverse.len() >= self.limit;
        if over {
            self.force_flush.store(true, Ordering::Release);
        }
        over
    }

    #[must_use]
    pub fn lookup_forward(&self, from_id: &str) -> Option<String> {
        self.forward.get(from_id).map(|v| v.value().clone())
    }

    #[must_use]
    pub fn lookup_reverse(&self, to_id: &str) -> Option<String> {
        self.reverse.get(to_id).map(|v| v.value().clone())
    }

    pub fn remove_forward(&self, from_id: &str) -> Option<String> {
        self.forward.remove(from_id).map(|(_, v)| v)
    }

    pub fn remove_reverse(&self, to_id: &str) -> Option<String> {
        self.reverse.remove(to_id).map(|(_, v)| v)
    }

    /// Removes `from_id` and the reverse entry of the value it mapped to.
    ///
    /// The reverse entry is only removed while it still points back at
    /// `from_id`; a newer association for the same `to_id` survives.
    pub fn remove_pair(&self, from_id: &str) -> Option<String> {
        let (_, to_id) = self.forward.remove(from_id)?;
        self.reverse.remove_if(&to_id, |_, from| from == from_id);
        Some(to_id)
    }

    /// Reads and clears the force-flush flag.
    pub fn take_force_flush(&self) -> bool {
        self.force_flush.swap(false, Ordering::AcqRel)
    }

    #[must_use]
    pub fn force_flush_requested(&self) -> bool {
        self.force_flush.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn forward_len(&self) -> usize {
        self.forward.len()
    }

    #[must_use]
    pub fn reverse_len(&self) -> usize {
        self.reverse.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn put_populates_both_directions() {
        let cache = HotCache::new(100);
        cache.put("u1", "v1");
        assert_eq!(cache.lookup_forward("u1").as_deref(), Some("v1"));
        assert_eq!(cache.lookup_reverse("v1").as_deref(), Some("u1"));
    }

    #[test]
    fn put_overwrites_prior_value() {
        let cache = HotCache::new(100);
        cache.put("u1", "v1");
        cache.put("u1", "v2");
        assert_eq!(cache.lookup_forward("u1").as_deref(), Some("v2"));
        assert_eq!(cache.lookup_reverse("v2").as_deref(), Some("u1"));
        assert!(cache.lookup_reverse("v1").is_none());
        assert_eq!(cache.reverse_len(), 1);

        cache.remove_pair("u1");
        assert_eq!(cache.reverse_len(), 0);
    }

    #[test]
    fn remap_keeps_reverse_entry_claimed_by_another_id() {
        let cache = HotCache::new(100);
        cache.put("u1", "v1");
        cache.put("u2", "v1");
        cache.put("u1", "v2");
        assert_eq!(cache.lookup_reverse("v1").as_deref(), Some("u2"));
        assert_eq!(cache.lookup_reverse("v2").as_deref(), Some("u1"));
    }

    #[test]
    fn directions_are_removed_independently() {
        let cache = HotCache::new(100);
        cache.put("u1", "v1");
        assert_eq!(cache.remove_forward("u1").as_deref(), Some("v1"));
        assert!(cache.lookup_forward("u1").is_none());
        assert_eq!(cache.lookup_reverse("v1").as_deref(), Some("u1"));

        cache.put("u2", "v2");
        cache.remove_reverse("v2");
        assert!(cache.lookup_reverse("v2").is_none());
        assert_eq!(cache.lookup_forward("u2").as_deref(), Some("v2"));
    }

    #[test]
    fn remove_pair_clears_both_sides() {
        let cache = HotCache::new(100);
        cache.put("u1", "v1");
        assert_eq!(cache.remove_pair("u1").as_deref(), Some("v1"));
        assert!(cache.lookup_forward("u1").is_none());
        assert!(cache.lookup_reverse("v1").is_none());
        assert!(cache.remove_pair("u1").is_none());
    }

    #[test]
    fn remove_pair_keeps_newer_reverse_owner() {
        let cache = HotCache::new(100);
        cache.put("u1", "v1");
        cache.put("u2", "v1");
        cache.remove_pair("u1");
        assert_eq!(cache.lookup_reverse("v1").as_deref(), Some("u2"));
    }

    #[test]
    fn watchdog_sets_and_take_resets_force_flush() {
        let cache = HotCache::new(3);
        assert!(!cache.put("a", "1"));
        assert!(!cache.put("b", "2"));
        assert!(!cache.force_flush_requested());
        assert!(cache.put("c", "3"));
        assert!(cache.force_flush_requested());
        assert!(cache.take_force_flush());
        assert!(!cache.take_force_flush());
    }

    #[test]
    fn concurrent_puts_are_all_visible() {
        let cache = Arc::new(HotCache::new(usize::MAX));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        cache.put(&format!("f{t}-{i}"), &format!("t{t}-{i}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.forward_len(), 4_000);
        assert_eq!(cache.reverse_len(), 4_000);
        for t in 0..8 {
            for i in 0..500 {
                let from = format!("f{t}-{i}");
                let to = format!("t{t}-{i}");
                assert_eq!(cache.lookup_forward(&from), Some(to.clone()));
                assert_eq!(cache.lookup_reverse(&to), Some(from));
            }
        }
    }
}
