//! Sharded fan-out of batch writes across the worker pool.
//!
//! Rows are grouped by shard, the shard list is cut into one contiguous
//! slice per worker, and each slice becomes one pool task that writes its
//! shards chunk by chunk. A failing chunk is logged and counted; the rest of
//! the slice still runs.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use idmap_core::{Direction, TableKind, TableRef};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::pool::{Dispatched, WorkerPool};
use super::round::DispatchRound;
use crate::storage::{IdRow, MappingStore, StoreError};

// ---------------------------------------------------------------------------
// Partitioning
// ---------------------------------------------------------------------------

/// Splits `0..len` into `min(workers, len)` contiguous ranges.
///
/// Sizes differ by at most one; the first `len % slices` ranges take the
/// extra element, so every index is covered exactly once.
#[must_use]
pub fn partition_slices(len: usize, workers: usize) -> Vec<Range<usize>> {
    let slices = workers.max(1).min(len);
    if slices == 0 {
        return Vec::new();
    }
    let base = len / slices;
    let extra = len % slices;
    let mut ranges = Vec::with_capacity(slices);
    let mut start = 0;
    for i in 0..slices {
        let end = start + base + usize::from(i < extra);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Groups `items` by the shard `shard` assigns them.
pub fn group_by_shard<T>(
    items: impl IntoIterator<Item = T>,
    shard: impl Fn(&T) -> u32,
) -> BTreeMap<u32, Vec<T>> {
    let mut groups: BTreeMap<u32, Vec<T>> = BTreeMap::new();
    for item in items {
        groups.entry(shard(&item)).or_default().push(item);
    }
    groups
}

// ---------------------------------------------------------------------------
// ChunkSink
// ---------------------------------------------------------------------------

/// Destination of one table family's chunks.
#[async_trait]
pub trait ChunkSink: Send + Sync + 'static {
    type Item: Send + Sync + 'static;

    /// Table family written by this sink.
    fn kind(&self) -> TableKind;

    /// Writes one chunk to one table, returning rows affected.
    async fn write(&self, table: TableRef, chunk: &[Self::Item]) -> Result<u64, StoreError>;

    /// Called after a chunk failed. Default is a no-op.
    fn on_failure(&self, _round: &DispatchRound, _chunk: &[Self::Item]) {}
}

/// Batched inserts into one table family.
pub struct InsertSink {
    store: Arc<dyn MappingStore>,
    kind: TableKind,
}

impl InsertSink {
    #[must_use]
    pub fn new(store: Arc<dyn MappingStore>, kind: TableKind) -> Self {
        Self { store, kind }
    }
}

#[async_trait]
impl ChunkSink for InsertSink {
    type Item = IdRow;

    fn kind(&self) -> TableKind {
        self.kind
    }

    async fn write(&self, table: TableRef, chunk: &[IdRow]) -> Result<u64, StoreError> {
        self.store.insert_batch(table, chunk).await
    }

    fn on_failure(&self, round: &DispatchRound, chunk: &[IdRow]) {
        round.record_failed_rows(chunk);
    }
}

/// Batched deletes by key for one direction.
///
/// Forward deletes address the from-indexed tables by `from_id`; reverse
/// deletes address the to-indexed tables by `to_id`.
pub struct DeleteSink {
    store: Arc<dyn MappingStore>,
    direction: Direction,
}

impl DeleteSink {
    #[must_use]
    pub fn new(store: Arc<dyn MappingStore>, direction: Direction) -> Self {
        Self { store, direction }
    }
}

#[async_trait]
impl ChunkSink for DeleteSink {
    type Item = String;

    fn kind(&self) -> TableKind {
        self.direction.table_kind()
    }

    async fn write(&self, table: TableRef, chunk: &[String]) -> Result<u64, StoreError> {
        match self.direction {
            Direction::Forward => self.store.delete_by_from_ids(table, chunk).await,
            Direction::Reverse => self.store.delete_by_to_ids(table, chunk).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Writes one slice of shards. Runs as a single pool task.
async fn write_slice<S: ChunkSink>(
    sink: Arc<S>,
    round: Arc<DispatchRound>,
    shards: Vec<(u32, Vec<S::Item>)>,
    batch: usize,
) {
    for (shard, rows) in shards {
        let table = TableRef::new(sink.kind(), shard);
        for chunk in rows.chunks(batch.max(1)) {
            let len = chunk.len() as u64;
            match sink.write(table, chunk).await {
                Ok(affected) => {
                    debug!(round = round.id(), ?table, rows = len, affected, "chunk written");
                    round.chunk_succeeded(len);
                }
                Err(err) => {
                    warn!(round = round.id(), ?table, rows = len, error = %err, "chunk failed");
                    metrics::counter!("idmap_failed_chunks_total").increment(1);
                    round.chunk_failed(len);
                    sink.on_failure(&round, chunk);
                }
            }
        }
    }
    round.task_finished();
}

/// Fans `groups` out across `pool`, one task per contiguous slice of shards.
///
/// Returns the handles of spawned tasks; tasks that ran inline have already
/// finished.
pub async fn dispatch<S: ChunkSink>(
    pool: &WorkerPool,
    round: &Arc<DispatchRound>,
    sink: Arc<S>,
    groups: BTreeMap<u32, Vec<S::Item>>,
    batch: usize,
) -> Vec<JoinHandle<()>> {
    let mut shards: Vec<(u32, Vec<S::Item>)> = groups.into_iter().collect();
    let ranges = partition_slices(shards.len(), pool.size());
    let mut handles = Vec::with_capacity(ranges.len());
    // Peel slices off the back so each drain is O(slice).
    for range in ranges.into_iter().rev() {
        let slice: Vec<_> = shards.drain(range).collect();
        round.task_dispatched();
        let task = write_slice(Arc::clone(&sink), Arc::clone(round), slice, batch);
        if let Dispatched::Spawned(handle) = pool.dispatch(task).await {
            handles.push(handle);
        }
    }
    handles
}

/// Waits up to `bound` for `handles`, then settles the round's state.
///
/// Tasks still running at the deadline are detached, not cancelled.
pub async fn await_round(round: &DispatchRound, handles: Vec<JoinHandle<()>>, bound: Duration) {
    if tokio::time::timeout(bound, join_all(handles)).await.is_ok() {
        round.complete();
    } else {
        let snap = round.snapshot();
        warn!(
            round = snap.id,
            unconfirmed = snap.unconfirmed(),
            wait_secs = bound.as_secs(),
            "dispatch round timed out; continuing without the stragglers"
        );
        round.time_out();
    }
}
