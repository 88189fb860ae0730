//! Explicit deletes and the parity-bucket drain.

use std::sync::Arc;

use idmap_core::{shard_of, Direction};
use serde::Serialize;
use tracing::info;

use super::fanout::{await_round, dispatch, group_by_shard, DeleteSink};
use super::round::{RoundKind, RoundSnapshot};
use super::Engine;

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub parity: usize,
    pub forward: usize,
    pub reverse: usize,
    pub round: Option<RoundSnapshot>,
}

impl Engine {
    /// Parity of the current second; deletes issued now land in this bucket.
    #[must_use]
    pub fn current_parity(&self) -> usize {
        usize::from(self.clock.now_secs() % 2 == 1)
    }

    /// Removes `from_id` from the forward hot map and forward pending buffer
    /// and queues its storage delete.
    ///
    /// The reverse entry pointing at `from_id` is left alone.
    pub fn delete_forward(&self, from_id: &str) {
        self.hot.remove_forward(from_id);
        self.pending.remove_forward(from_id);
        self.deletes
            .add(Direction::Forward, self.current_parity(), from_id);
    }

    /// Removes `to_id` from the reverse hot map and reverse pending buffer
    /// and queues its storage delete.
    pub fn delete_reverse(&self, to_id: &str) {
        self.hot.remove_reverse(to_id);
        self.pending.remove_reverse(to_id);
        self.deletes
            .add(Direction::Reverse, self.current_parity(), to_id);
    }

    /// Issues the storage deletes queued in the `parity` buckets.
    ///
    /// Forward ids are deleted by `from_id` from the from-indexed table of
    /// their shard; reverse ids by `to_id` from the to-indexed table. Only
    /// the ids read at the start of the drain are cleared afterwards.
    pub async fn drain_deletes(&self, parity: usize) -> DrainReport {
        let forward = self.deletes.snapshot(Direction::Forward, parity);
        let reverse = self.deletes.snapshot(Direction::Reverse, parity);
        let mut report = DrainReport {
            parity,
            forward: forward.len(),
            reverse: reverse.len(),
            round: None,
        };
        if forward.is_empty() && reverse.is_empty() {
            return report;
        }

        let hash_mod = self.config.hash_mod;
        let batch = self.config.batch_count;
        let round = self.rounds.open(RoundKind::Delete, self.clock.now());
        let mut handles = dispatch(
            &self.pool,
            &round,
            Arc::new(DeleteSink::new(Arc::clone(&self.store), Direction::Forward)),
            group_by_shard(forward.iter().cloned(), |id| shard_of(id, hash_mod)),
            batch,
        )
        .await;
        handles.extend(
            dispatch(
                &self.pool,
                &round,
                Arc::new(DeleteSink::new(Arc::clone(&self.store), Direction::Reverse)),
                group_by_shard(reverse.iter().cloned(), |id| shard_of(id, hash_mod)),
                batch,
            )
            .await,
        );
        await_round(&round, handles, self.config.dispatch_wait).await;

        self.deletes
            .clear_processed(Direction::Forward, parity, &forward);
        self.deletes
            .clear_processed(Direction::Reverse, parity, &reverse);

        let snap = round.snapshot();
        metrics::counter!("idmap_deletes_drained_total")
            .increment((report.forward + report.reverse) as u64);
        info!(
            parity,
            forward = report.forward,
            reverse = report.reverse,
            failed_chunks = snap.chunks_failed,
            "delete buckets drained"
        );
        report.round = Some(snap);
        report
    }
}
