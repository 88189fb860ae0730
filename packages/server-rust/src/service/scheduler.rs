//! Periodic job runner.
//!
//! Each job runs on its own tokio task at a fixed cadence after an initial
//! delay. Every run holds the job's advisory lock, so a tick never overlaps
//! a manual run of the same job; a tick that cannot take the lock within
//! `lock_wait` is skipped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::config::JobSchedule;

// ---------------------------------------------------------------------------
// PeriodicJob trait
// ---------------------------------------------------------------------------

/// One unit of background work.
#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn run(&self);
}

// ---------------------------------------------------------------------------
// ScheduledJob
// ---------------------------------------------------------------------------

/// A job paired with its advisory lock.
pub struct ScheduledJob {
    job: Arc<dyn PeriodicJob>,
    lock: Mutex<()>,
    lock_wait: Duration,
}

impl ScheduledJob {
    #[must_use]
    pub fn new(job: Arc<dyn PeriodicJob>, lock_wait: Duration) -> Self {
        Self {
            job,
            lock: Mutex::new(()),
            lock_wait,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.job.name()
    }

    /// Runs the job once under its lock.
    ///
    /// Returns `false` if the lock was not acquired within `lock_wait`.
    pub async fn run_once(&self) -> bool {
        let Ok(_guard) = tokio::time::timeout(self.lock_wait, self.lock.lock()).await else {
            warn!(job = self.name(), "job lock busy, skipping run");
            metrics::counter!("idmap_job_skipped_total", "job" => self.name()).increment(1);
            return false;
        };
        let started = Instant::now();
        self.job.run().await;
        debug!(
            job = self.name(),
            elapsed_ms = started.elapsed().as_millis(),
            "job finished"
        );
        true
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Owns the job loops and the shutdown signal that stops them.
pub struct Scheduler {
    lock_wait: Duration,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(lock_wait: Duration) -> Self {
        let (shutdown_tx, _rx) = watch::channel(false);
        Self {
            lock_wait,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Starts `job` on `schedule` and returns its handle for manual runs.
    pub fn spawn(&mut self, job: Arc<dyn PeriodicJob>, schedule: JobSchedule) -> Arc<ScheduledJob> {
        let scheduled = Arc::new(ScheduledJob::new(job, self.lock_wait));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = schedule.period.max(Duration::from_millis(1));
        let task_job = Arc::clone(&scheduled);

        info!(
            job = scheduled.name(),
            initial_delay_ms = schedule.initial_delay.as_millis(),
            period_ms = period.as_millis(),
            "scheduling job"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + schedule.initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        task_job.run_once().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(job = task_job.name(), "job loop stopped");
        });

        self.handles.push(handle);
        scheduled
    }

    /// Number of running job loops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signals every loop to stop and waits for them.
    ///
    /// A job already running finishes its current run first. Returns the
    /// number of loops that ended abnormally.
    pub async fn shutdown(self) -> usize {
        if self.shutdown_tx.send(true).is_err() {
            debug!("no job loop left to signal");
        }
        let mut failed = 0;
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "job loop ended abnormally");
                failed += 1;
            }
        }
        info!(failed, "scheduler stopped");
        failed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counting {
        runs: AtomicUsize,
        work: Duration,
    }

    impl Counting {
        fn new(work: Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                work,
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PeriodicJob for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&self) {
            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_initial_delay_then_ticks() {
        let job = Counting::new(Duration::ZERO);
        let mut scheduler = Scheduler::new(Duration::from_secs(60));
        scheduler.spawn(
            job.clone(),
            JobSchedule::new(Duration::from_secs(60), Duration::from_secs(10)),
        );

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(job.runs(), 0);

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(job.runs(), 2);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_ticking() {
        let job = Counting::new(Duration::ZERO);
        let mut scheduler = Scheduler::new(Duration::from_secs(60));
        scheduler.spawn(
            job.clone(),
            JobSchedule::new(Duration::ZERO, Duration::from_secs(1)),
        );
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let before = job.runs();
        assert!(before >= 1);

        scheduler.shutdown().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(job.runs(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_lock_skips_the_run() {
        let job = Counting::new(Duration::from_secs(120));
        let scheduled = Arc::new(ScheduledJob::new(job.clone(), Duration::from_secs(5)));

        let long_run = tokio::spawn({
            let scheduled = Arc::clone(&scheduled);
            async move { scheduled.run_once().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!scheduled.run_once().await);
        assert!(long_run.await.unwrap());
        assert_eq!(job.runs(), 1);
    }

    struct Panicking;

    #[async_trait]
    impl PeriodicJob for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn run(&self) {
            panic!("job failure");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_reports_panicked_loops() {
        let job = Counting::new(Duration::ZERO);
        let mut scheduler = Scheduler::new(Duration::from_secs(1));
        scheduler.spawn(
            Arc::new(Panicking),
            JobSchedule::new(Duration::ZERO, Duration::from_secs(1)),
        );
        scheduler.spawn(
            job.clone(),
            JobSchedule::new(Duration::ZERO, Duration::from_secs(1)),
        );
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(scheduler.shutdown().await, 1);
        assert!(job.runs() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_run_after_shutdown() {
        let job = Counting::new(Duration::ZERO);
        let mut scheduler = Scheduler::new(Duration::from_secs(1));
        let handle = scheduler.spawn(
            job.clone(),
            JobSchedule::new(Duration::from_secs(60), Duration::from_secs(60)),
        );
        assert_eq!(scheduler.len(), 1);
        scheduler.shutdown().await;

        assert!(handle.run_once().await);
        assert_eq!(job.runs(), 1);
    }
}
