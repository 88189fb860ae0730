//! The mapping engine: hot cache, staging state, and the background stages
//! that move associations from memory to storage and back out again.
//!
//! One [`Engine`] is built at startup and shared as `Arc<Engine>` by the
//! request handlers, the scheduler jobs, and the binlog. Each stage lives in
//! its own submodule as an `impl Engine` block:
//!
//! - [`promotion`]: expiry queue to pending buffers
//! - [`write_behind`]: pending buffers to storage, then delayed purge
//! - [`deletion`]: explicit deletes and the parity-bucket drain
//! - [`expiry_sweep`]: retention deletes in storage

pub mod deletion;
pub mod expiry_sweep;
pub mod fanout;
pub mod pool;
pub mod promotion;
pub mod round;
pub mod write_behind;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use idmap_core::{shard_of, Association, ClockSource, TableKind, TableRef};
use parking_lot::RwLock;
use serde::Serialize;

use crate::binlog::DurabilityQueue;
use crate::service::config::MappingConfig;
use crate::storage::{
    DelayedPurge, DeleteBuckets, ExpiryQueue, HotCache, MappingStore, PendingBuffers, StoreError,
};

pub use deletion::DrainReport;
pub use expiry_sweep::SweepReport;
pub use pool::{Dispatched, WorkerPool};
pub use promotion::PromotionReport;
pub use round::{DispatchRound, RoundKind, RoundLedger, RoundSnapshot, RoundState};
pub use write_behind::{CycleReport, EnterDbReport};

/// Sizes of every in-memory structure, reported by `/idMapping/getMemSize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub forward_size: usize,
    pub reverse_size: usize,
    pub expiry_queue_size: usize,
    pub pending_forward_size: usize,
    pub pending_reverse_size: usize,
    pub delayed_purge_size: usize,
    pub delete_requests: usize,
    pub durability_queue_size: usize,
    pub pool_occupied: usize,
    pub cursor: Option<String>,
}

/// Shared engine state. All methods take `&self`.
pub struct Engine {
    config: MappingConfig,
    clock: Arc<dyn ClockSource>,
    store: Arc<dyn MappingStore>,
    hot: HotCache,
    expiry: ExpiryQueue,
    pending: PendingBuffers,
    purge: DelayedPurge,
    deletes: DeleteBuckets,
    /// Persistence cycles run so far; picks the parity each cycle drains.
    drain_cycles: AtomicUsize,
    durability: DurabilityQueue,
    cursor: RwLock<Option<String>>,
    pool: WorkerPool,
    rounds: RoundLedger,
}

impl Engine {
    #[must_use]
    pub fn new(
        config: MappingConfig,
        store: Arc<dyn MappingStore>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let pool = WorkerPool::new(config.enter_db_thread_size, config.pool_queue_capacity);
        Self {
            hot: HotCache::new(config.limit_count),
            expiry: ExpiryQueue::new(),
            pending: PendingBuffers::new(),
            purge: DelayedPurge::new(),
            deletes: DeleteBuckets::new(),
            drain_cycles: AtomicUsize::new(0),
            durability: DurabilityQueue::new(),
            cursor: RwLock::new(None),
            rounds: RoundLedger::new(),
            pool,
            config,
            clock,
            store,
        }
    }

    #[must_use]
    pub fn config(&self) -> &MappingConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn ClockSource> {
        &self.clock
    }

    #[must_use]
    pub fn hot(&self) -> &HotCache {
        &self.hot
    }

    #[must_use]
    pub fn pending(&self) -> &PendingBuffers {
        &self.pending
    }

    #[must_use]
    pub fn expiry(&self) -> &ExpiryQueue {
        &self.expiry
    }

    #[must_use]
    pub fn durability(&self) -> &DurabilityQueue {
        &self.durability
    }

    #[must_use]
    pub fn deletes(&self) -> &DeleteBuckets {
        &self.deletes
    }

    #[must_use]
    pub fn rounds(&self) -> &RoundLedger {
        &self.rounds
    }

    /// Records an association: hot cache, expiry queue, durability queue.
    pub fn insert(&self, from_id: &str, to_id: &str) {
        let now = self.clock.now();
        self.hot.put(from_id, to_id);
        self.expiry.record_insertion(from_id, now);
        self.durability.push(from_id);
        metrics::counter!("idmap_inserts_total").increment(1);
    }

    pub fn insert_batch(&self, associations: &[Association]) {
        for association in associations {
            self.insert(&association.from_id, &association.to_id);
        }
    }

    /// Hot-cache-only forward lookup.
    #[must_use]
    pub fn lookup_forward(&self, from_id: &str) -> Option<String> {
        self.hot.lookup_forward(from_id)
    }

    /// Hot-cache-only reverse lookup.
    #[must_use]
    pub fn lookup_reverse(&self, to_id: &str) -> Option<String> {
        self.hot.lookup_reverse(to_id)
    }

    /// Forward lookup against the from-indexed table of `from_id`'s shard.
    ///
    /// # Errors
    ///
    /// Propagates the store's error.
    pub async fn store_lookup_forward(&self, from_id: &str) -> Result<Option<String>, StoreError> {
        let table = TableRef::new(TableKind::FromIndexed, shard_of(from_id, self.config.hash_mod));
        self.store.select_to_id(table, from_id).await
    }

    /// Reverse lookup against the to-indexed table of `to_id`'s shard.
    ///
    /// # Errors
    ///
    /// Propagates the store's error.
    pub async fn store_lookup_reverse(&self, to_id: &str) -> Result<Option<String>, StoreError> {
        let table = TableRef::new(TableKind::ToIndexed, shard_of(to_id, self.config.hash_mod));
        self.store.select_from_id(table, to_id).await
    }

    /// Highest fromId known to be persisted.
    #[must_use]
    pub fn cursor(&self) -> Option<String> {
        self.cursor.read().clone()
    }

    /// Moves the cursor to `id` if it sorts after the current one.
    ///
    /// Returns `true` if the cursor moved.
    pub fn advance_cursor(&self, id: &str) -> bool {
        let mut cursor = self.cursor.write();
        if cursor.as_deref().is_some_and(|current| current >= id) {
            return false;
        }
        *cursor = Some(id.to_string());
        true
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            forward_size: self.hot.forward_len(),
            reverse_size: self.hot.reverse_len(),
            expiry_queue_size: self.expiry.len(),
            pending_forward_size: self.pending.forward_len(),
            pending_reverse_size: self.pending.reverse_len(),
            delayed_purge_size: self.purge.len(),
            delete_requests: self.deletes.total(),
            durability_queue_size: self.durability.len(),
            pool_occupied: self.pool.occupied(),
            cursor: self.cursor(),
        }
    }

    /// Publishes [`stats`](Self::stats) as gauges.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_gauges(&self) {
        let stats = self.stats();
        metrics::gauge!("idmap_hot_forward_entries").set(stats.forward_size as f64);
        metrics::gauge!("idmap_hot_reverse_entries").set(stats.reverse_size as f64);
        metrics::gauge!("idmap_expiry_queue_len").set(stats.expiry_queue_size as f64);
        metrics::gauge!("idmap_pending_entries").set(stats.pending_forward_size as f64);
        metrics::gauge!("idmap_delayed_purge_len").set(stats.delayed_purge_size as f64);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{harness, small_config};

    #[tokio::test]
    async fn insert_is_visible_both_ways() {
        let h = harness(small_config()).await;
        h.engine.insert("u1", "v1");
        assert_eq!(h.engine.lookup_forward("u1").as_deref(), Some("v1"));
        assert_eq!(h.engine.lookup_reverse("v1").as_deref(), Some("u1"));

        let stats = h.engine.stats();
        assert_eq!(stats.forward_size, 1);
        assert_eq!(stats.expiry_queue_size, 1);
        assert_eq!(stats.durability_queue_size, 1);
    }

    #[tokio::test]
    async fn insert_batch_applies_every_pair() {
        let h = harness(small_config()).await;
        let pairs: Vec<_> = (0..10)
            .map(|i| idmap_core::Association::new(format!("f{i}"), format!("t{i}")))
            .collect();
        h.engine.insert_batch(&pairs);
        for i in 0..10 {
            assert_eq!(
                h.engine.lookup_forward(&format!("f{i}")),
                Some(format!("t{i}"))
            );
            assert_eq!(
                h.engine.lookup_reverse(&format!("t{i}")),
                Some(format!("f{i}"))
            );
        }
    }

    #[tokio::test]
    async fn cursor_only_moves_forward() {
        let h = harness(small_config()).await;
        assert!(h.engine.advance_cursor("m"));
        assert!(!h.engine.advance_cursor("a"));
        assert!(!h.engine.advance_cursor("m"));
        assert!(h.engine.advance_cursor("z"));
        assert_eq!(h.engine.cursor().as_deref(), Some("z"));
    }
}
