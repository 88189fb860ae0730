//! Dispatch rounds: one fan-out of sharded batch I/O and its outcome.
//!
//! A round starts `Dispatched`. If every task reports back within the wait
//! bound it becomes `Completed`; otherwise `TimedOut`, and the tasks still
//! running keep updating its counters after the engine has moved on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::storage::IdRow;

/// Rounds kept for inspection.
const LEDGER_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundKind {
    Insert,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    /// Tasks handed to the pool, not all confirmed.
    Dispatched,
    /// Every task finished within the wait bound.
    Completed,
    /// The wait bound elapsed first; unfinished tasks were detached.
    TimedOut,
}

/// Live counters of one round, shared with its tasks.
#[derive(Debug)]
pub struct DispatchRound {
    id: u64,
    kind: RoundKind,
    started_at: u64,
    state: Mutex<RoundState>,
    tasks: AtomicUsize,
    tasks_finished: AtomicUsize,
    chunks_ok: AtomicU64,
    chunks_failed: AtomicU64,
    rows_ok: AtomicU64,
    rows_failed: AtomicU64,
    failed_rows: Mutex<Vec<IdRow>>,
}

/// Copy of a round's counters at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundSnapshot {
    pub id: u64,
    pub kind: RoundKind,
    pub started_at: u64,
    pub state: RoundState,
    pub tasks: usize,
    pub tasks_finished: usize,
    pub chunks_ok: u64,
    pub chunks_failed: u64,
    pub rows_ok: u64,
    pub rows_failed: u64,
}

impl RoundSnapshot {
    /// Tasks dispatched but not confirmed.
    #[must_use]
    pub fn unconfirmed(&self) -> usize {
        self.tasks.saturating_sub(self.tasks_finished)
    }
}

impl DispatchRound {
    fn new(id: u64, kind: RoundKind, started_at: u64) -> Self {
        Self {
            id,
            kind,
            started_at,
            state: Mutex::new(RoundState::Dispatched),
            tasks: AtomicUsize::new(0),
            tasks_finished: AtomicUsize::new(0),
            chunks_ok: AtomicU64::new(0),
            chunks_failed: AtomicU64::new(0),
            rows_ok: AtomicU64::new(0),
            rows_failed: AtomicU64::new(0),
            failed_rows: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> RoundState {
        *self.state.lock()
    }

    pub(crate) fn task_dispatched(&self) {
        self.tasks.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn task_finished(&self) {
        self.tasks_finished.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn chunk_succeeded(&self, rows: u64) {
        self.chunks_ok.fetch_add(1, Ordering::Relaxed);
        self.rows_ok.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn chunk_failed(&self, rows: u64) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
        self.rows_failed.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_rows(&self, rows: &[IdRow]) {
        self.failed_rows.lock().extend_from_slice(rows);
    }

    /// Takes the rows of failed insert chunks recorded so far.
    pub fn take_failed_rows(&self) -> Vec<IdRow> {
        std::mem::take(&mut *self.failed_rows.lock())
    }

    pub(crate) fn complete(&self) {
        let mut state = self.state.lock();
        if *state == RoundState::Dispatched {
            *state = RoundState::Completed;
        }
    }

    pub(crate) fn time_out(&self) {
        let mut state = self.state.lock();
        if *state == RoundState::Dispatched {
            *state = RoundState::TimedOut;
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            id: self.id,
            kind: self.kind,
            started_at: self.started_at,
            state: self.state(),
            tasks: self.tasks.load(Ordering::Acquire),
            tasks_finished: self.tasks_finished.load(Ordering::Acquire),
            chunks_ok: self.chunks_ok.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            rows_ok: self.rows_ok.load(Ordering::Relaxed),
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
        }
    }
}

/// Bounded history of recent rounds, newest last.
#[derive(Debug, Default)]
pub struct RoundLedger {
    next_id: AtomicU64,
    rounds: Mutex<VecDeque<Arc<DispatchRound>>>,
}

impl RoundLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new round and records it, evicting the oldest when full.
    pub fn open(&self, kind: RoundKind, started_at: u64) -> Arc<DispatchRound> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let round = Arc::new(DispatchRound::new(id, kind, started_at));
        let mut rounds = self.rounds.lock();
        if rounds.len() == LEDGER_CAPACITY {
            rounds.pop_front();
        }
        rounds.push_back(Arc::clone(&round));
        round
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<RoundSnapshot> {
        self.rounds.lock().iter().map(|r| r.snapshot()).collect()
    }

    /// Most recent round of `kind`.
    #[must_use]
    pub fn latest(&self, kind: RoundKind) -> Option<RoundSnapshot> {
        self.rounds
            .lock()
            .iter()
            .rev()
            .find(|r| r.kind == kind)
            .map(|r| r.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_round_cannot_time_out() {
        let ledger = RoundLedger::new();
        let round = ledger.open(RoundKind::Insert, 0);
        round.complete();
        round.time_out();
        assert_eq!(round.state(), RoundState::Completed);
    }

    #[test]
    fn timed_out_round_keeps_counting() {
        let ledger = RoundLedger::new();
        let round = ledger.open(RoundKind::Delete, 0);
        round.task_dispatched();
        round.task_dispatched();
        round.task_finished();
        round.time_out();

        let snap = round.snapshot();
        assert_eq!(snap.state, RoundState::TimedOut);
        assert_eq!(snap.unconfirmed(), 1);

        round.task_finished();
        round.chunk_succeeded(10);
        let snap = round.snapshot();
        assert_eq!(snap.unconfirmed(), 0);
        assert_eq!(snap.rows_ok, 10);
        assert_eq!(snap.state, RoundState::TimedOut);
    }

    #[test]
    fn ledger_is_bounded_and_ordered() {
        let ledger = RoundLedger::new();
        for i in 0..(LEDGER_CAPACITY as u64 + 5) {
            ledger.open(RoundKind::Insert, i);
        }
        let snaps = ledger.snapshots();
        assert_eq!(snaps.len(), LEDGER_CAPACITY);
        assert_eq!(snaps[0].id, 6);
        assert_eq!(snaps.last().map(|s| s.id), Some(LEDGER_CAPACITY as u64 + 5));
    }

    #[test]
    fn latest_filters_by_kind() {
        let ledger = RoundLedger::new();
        ledger.open(RoundKind::Insert, 1);
        ledger.open(RoundKind::Delete, 2);
        ledger.open(RoundKind::Insert, 3);
        assert_eq!(ledger.latest(RoundKind::Delete).map(|s| s.started_at), Some(2));
        assert_eq!(ledger.latest(RoundKind::Insert).map(|s| s.started_at), Some(3));
    }

    #[test]
    fn failed_rows_are_taken_once() {
        let round = RoundLedger::new().open(RoundKind::Insert, 0);
        round.record_failed_rows(&[IdRow::new("a", "b")]);
        assert_eq!(round.take_failed_rows().len(), 1);
        assert!(round.take_failed_rows().is_empty());
    }
}
