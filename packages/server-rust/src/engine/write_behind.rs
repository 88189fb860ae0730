//! Write-behind persistence: pending buffers to storage, then delayed purge
//! from the hot cache.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use idmap_core::{shard_of, TableKind};
use serde::Serialize;
use tracing::{debug, info};

use super::deletion::DrainReport;
use super::expiry_sweep::SweepReport;
use super::fanout::{await_round, dispatch, group_by_shard, InsertSink};
use super::round::{RoundKind, RoundSnapshot};
use super::Engine;
use crate::storage::IdRow;

/// Outcome of one `enter_db` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnterDbReport {
    /// Rows sent to the to-indexed tables (from the forward buffer).
    pub forward_rows: usize,
    /// Rows sent to the from-indexed tables (from the reverse buffer).
    pub reverse_rows: usize,
    /// fromIds queued for delayed purge.
    pub scheduled_for_purge: usize,
    /// Rows of failed chunks put back into the pending buffers.
    pub requeued: usize,
    pub round: Option<RoundSnapshot>,
}

/// Outcome of one full persistence cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub enter_db: EnterDbReport,
    pub purged: usize,
    pub deletes: DrainReport,
    pub expired: SweepReport,
}

impl Engine {
    /// Writes a snapshot of the pending buffers to storage.
    ///
    /// Forward entries go to the to-indexed table of `shard_of(to_id)`;
    /// reverse entries go to the from-indexed table of `shard_of(from_id)`.
    /// Both families are written in one dispatch round. Once the round
    /// settles (completed or timed out), the snapshotted entries leave the
    /// pending buffers and their fromIds are queued for purge one
    /// `mem_cache_time` from now, whether or not their chunk succeeded.
    /// With `retry_failed_chunks` set, rows of chunks that reported failure
    /// before the round settled are staged again instead.
    pub async fn enter_db(&self) -> EnterDbReport {
        let snapshot = self.pending.snapshot();
        if snapshot.is_empty() {
            debug!("pending buffers empty, nothing to persist");
            return EnterDbReport::default();
        }

        let hash_mod = self.config.hash_mod;
        let batch = self.config.batch_count;
        let to_indexed = group_by_shard(
            snapshot
                .forward
                .iter()
                .map(|(from_id, to_id)| IdRow::new(from_id.as_str(), to_id.as_str())),
            |row| shard_of(&row.to_id, hash_mod),
        );
        let from_indexed = group_by_shard(
            snapshot
                .reverse
                .iter()
                .map(|(to_id, from_id)| IdRow::new(from_id.as_str(), to_id.as_str())),
            |row| shard_of(&row.from_id, hash_mod),
        );

        let round = self.rounds.open(RoundKind::Insert, self.clock.now());
        let mut handles = dispatch(
            &self.pool,
            &round,
            Arc::new(InsertSink::new(Arc::clone(&self.store), TableKind::ToIndexed)),
            to_indexed,
            batch,
        )
        .await;
        handles.extend(
            dispatch(
                &self.pool,
                &round,
                Arc::new(InsertSink::new(Arc::clone(&self.store), TableKind::FromIndexed)),
                from_indexed,
                batch,
            )
            .await,
        );
        await_round(&round, handles, self.config.dispatch_wait).await;

        self.pending.settle(&snapshot);

        let mut purge_ids: BTreeSet<String> = snapshot
            .forward
            .iter()
            .map(|(from_id, _)| from_id.clone())
            .chain(snapshot.reverse.iter().map(|(_, from_id)| from_id.clone()))
            .collect();

        let mut requeued = 0;
        if self.config.retry_failed_chunks {
            for row in round.take_failed_rows() {
                purge_ids.remove(&row.from_id);
                // A delete or overwrite since the snapshot wins over the retry.
                if self.hot.lookup_forward(&row.from_id).as_deref() == Some(row.to_id.as_str()) {
                    self.pending.stage(&row.from_id, &row.to_id);
                    requeued += 1;
                }
            }
        }

        let due_at = self.clock.now().saturating_add(self.config.mem_cache_millis());
        let scheduled_for_purge = purge_ids.len();
        self.purge.schedule(due_at, purge_ids);

        let snap = round.snapshot();
        metrics::counter!("idmap_persisted_rows_total").increment(snap.rows_ok);
        info!(
            round = snap.id,
            state = ?snap.state,
            forward_rows = snapshot.forward.len(),
            reverse_rows = snapshot.reverse.len(),
            failed_chunks = snap.chunks_failed,
            scheduled_for_purge,
            requeued,
            "pending buffers dispatched to storage"
        );
        EnterDbReport {
            forward_rows: snapshot.forward.len(),
            reverse_rows: snapshot.reverse.len(),
            scheduled_for_purge,
            requeued,
            round: Some(snap),
        }
    }

    /// Evicts every fromId whose purge time has passed from the hot cache,
    /// advancing the cursor past each.
    pub fn sweep_delayed_purge(&self) -> usize {
        let due = self.purge.take_due(self.clock.now());
        for from_id in &due {
            self.hot.remove_pair(from_id);
            self.advance_cursor(from_id);
        }
        if !due.is_empty() {
            debug!(purged = due.len(), cursor = ?self.cursor(), "delayed purge swept");
        }
        due.len()
    }

    /// Parity drained by the next persistence cycle. Alternates per cycle so
    /// both buckets are drained whatever the cycle period.
    fn next_drain_parity(&self) -> usize {
        self.drain_cycles.fetch_add(1, Ordering::Relaxed) % 2
    }

    /// One persistence cycle: persist pending entries, sweep the delayed
    /// purge, drain one delete bucket (alternating between cycles), and
    /// delete rows past retention.
    pub async fn run_persistence_cycle(&self) -> CycleReport {
        let enter_db = self.enter_db().await;
        let purged = self.sweep_delayed_purge();
        let deletes = self.drain_deletes(self.next_drain_parity()).await;
        let expired = self.sweep_expired().await;
        self.record_gauges();
        CycleReport {
            enter_db,
            purged,
            deletes,
            expired,
        }
    }
}
