//! The periodic jobs of a running instance.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::config::ScheduleConfig;
use super::scheduler::{PeriodicJob, ScheduledJob, Scheduler};
use crate::binlog::Binlog;
use crate::cluster::PeerResolver;
use crate::engine::Engine;

/// Moves due associations from the expiry queue to the pending buffers.
pub struct PromotionJob {
    engine: Arc<Engine>,
}

impl PromotionJob {
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PeriodicJob for PromotionJob {
    fn name(&self) -> &'static str {
        "promotion"
    }

    async fn run(&self) {
        self.engine.promote();
    }
}

/// Persistence cycle followed by a peer-list refresh.
pub struct PersistenceJob {
    engine: Arc<Engine>,
    peers: Option<Arc<PeerResolver>>,
}

impl PersistenceJob {
    #[must_use]
    pub fn new(engine: Arc<Engine>, peers: Option<Arc<PeerResolver>>) -> Self {
        Self { engine, peers }
    }
}

#[async_trait]
impl PeriodicJob for PersistenceJob {
    fn name(&self) -> &'static str {
        "persistence"
    }

    async fn run(&self) {
        let report = self.engine.run_persistence_cycle().await;
        debug!(
            forward_rows = report.enter_db.forward_rows,
            reverse_rows = report.enter_db.reverse_rows,
            purged = report.purged,
            deleted_forward = report.deletes.forward,
            deleted_reverse = report.deletes.reverse,
            expired = report.expired.deleted,
            "persistence cycle finished"
        );
        if let Some(peers) = &self.peers {
            if let Err(err) = peers.refresh().await {
                warn!(error = %err, "peer refresh failed");
            }
        }
    }
}

/// Drains the durability queue into binlog files.
pub struct BinlogJob {
    engine: Arc<Engine>,
    binlog: Arc<Binlog>,
}

impl BinlogJob {
    #[must_use]
    pub fn new(engine: Arc<Engine>, binlog: Arc<Binlog>) -> Self {
        Self { engine, binlog }
    }
}

#[async_trait]
impl PeriodicJob for BinlogJob {
    fn name(&self) -> &'static str {
        "binlog"
    }

    async fn run(&self) {
        let engine = Arc::clone(&self.engine);
        let binlog = Arc::clone(&self.binlog);
        match tokio::task::spawn_blocking(move || binlog.flush(&engine)).await {
            Ok(Ok(report)) => debug!(
                files = report.files_written,
                lines = report.lines_written,
                pruned = report.pruned,
                "binlog flushed"
            ),
            Ok(Err(err)) => warn!(error = %err, "binlog flush failed"),
            Err(err) => warn!(error = %err, "binlog flush task panicked"),
        }
    }
}

/// Reloads the peer list.
pub struct PeerRefreshJob {
    peers: Arc<PeerResolver>,
}

impl PeerRefreshJob {
    #[must_use]
    pub fn new(peers: Arc<PeerResolver>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl PeriodicJob for PeerRefreshJob {
    fn name(&self) -> &'static str {
        "peer_refresh"
    }

    async fn run(&self) {
        if let Err(err) = self.peers.refresh().await {
            warn!(error = %err, "peer refresh failed");
        }
    }
}

/// Handles to the jobs that are also run outside their schedule.
pub struct JobHandles {
    pub binlog: Arc<ScheduledJob>,
}

/// Registers every job on `scheduler`.
pub fn spawn_all(
    scheduler: &mut Scheduler,
    schedule: &ScheduleConfig,
    engine: &Arc<Engine>,
    binlog: &Arc<Binlog>,
    peers: Option<&Arc<PeerResolver>>,
) -> JobHandles {
    scheduler.spawn(
        Arc::new(PromotionJob::new(Arc::clone(engine))),
        schedule.promotion,
    );
    scheduler.spawn(
        Arc::new(PersistenceJob::new(Arc::clone(engine), peers.cloned())),
        schedule.persistence,
    );
    let binlog = scheduler.spawn(
        Arc::new(BinlogJob::new(Arc::clone(engine), Arc::clone(binlog))),
        schedule.binlog,
    );
    if let Some(peers) = peers {
        scheduler.spawn(
            Arc::new(PeerRefreshJob::new(Arc::clone(peers))),
            schedule.peer_refresh,
        );
    }
    JobHandles { binlog }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::test_support::{harness, small_config};
    use crate::service::config::MappingConfig;

    #[tokio::test]
    async fn promotion_job_moves_due_entries() {
        let h = harness(MappingConfig {
            mem_cache_time: Duration::from_secs(1),
            ..small_config()
        })
        .await;
        h.engine.insert("u1", "v1");
        h.clock.advance(Duration::from_secs(2));

        PromotionJob::new(h.engine.clone()).run().await;
        assert!(h.engine.pending().contains_forward("u1"));
    }

    #[tokio::test]
    async fn binlog_job_drains_the_durability_queue() {
        let h = harness(small_config()).await;
        let dir = tempfile::tempdir().unwrap();
        let binlog = Arc::new(Binlog::new(dir.path(), 10));
        h.engine.insert("u1", "v1");
        h.engine.insert("u2", "v2");

        BinlogJob::new(h.engine.clone(), binlog).run().await;
        assert!(h.engine.durability().is_empty());
        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(files >= 1);
    }

    #[tokio::test]
    async fn persistence_job_writes_pending_rows() {
        let h = harness(small_config()).await;
        h.engine.pending().stage("u1", "v1");

        PersistenceJob::new(h.engine.clone(), None).run().await;
        assert_eq!(h.store.total_rows(), 2);
    }

    #[tokio::test]
    async fn spawn_all_skips_peer_job_without_peers() {
        let h = harness(small_config()).await;
        let dir = tempfile::tempdir().unwrap();
        let binlog = Arc::new(Binlog::new(dir.path(), 10));
        let mut scheduler = Scheduler::new(Duration::from_secs(1));
        let handles = spawn_all(
            &mut scheduler,
            &ScheduleConfig::default(),
            &h.engine,
            &binlog,
            None,
        );
        assert_eq!(scheduler.len(), 3);
        assert_eq!(handles.binlog.name(), "binlog");
        scheduler.shutdown().await;
    }
}
