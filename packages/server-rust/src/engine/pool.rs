//! Bounded worker pool for sharded batch I/O.
//!
//! `size` tasks run at once; up to `queue_capacity` more may wait for a
//! worker. When every queue slot is taken the caller runs the task itself,
//! which throttles the dispatching job instead of rejecting work.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// How a task was handed to the pool.
#[derive(Debug)]
pub enum Dispatched {
    /// Spawned onto the runtime; await the handle to observe completion.
    Spawned(JoinHandle<()>),
    /// The queue was full and the task already ran on the caller.
    RanInline,
}

/// Fixed-size async worker pool with caller-runs backpressure.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: Arc<Semaphore>,
    slots: Arc<Semaphore>,
    size: usize,
    capacity: usize,
}

impl WorkerPool {
    /// Creates a pool of `size` workers with `queue_capacity` waiting slots.
    #[must_use]
    pub fn new(size: usize, queue_capacity: usize) -> Self {
        let size = size.max(1);
        let capacity = size.saturating_add(queue_capacity);
        Self {
            workers: Arc::new(Semaphore::new(size)),
            slots: Arc::new(Semaphore::new(capacity)),
            size,
            capacity,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks currently running or waiting for a worker.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Spawns `task` if a slot is free, otherwise runs it to completion on
    /// the calling task.
    pub async fn dispatch<F>(&self, task: F) -> Dispatched
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(slot) = Arc::clone(&self.slots).try_acquire_owned() else {
            task.await;
            return Dispatched::RanInline;
        };
        let workers = Arc::clone(&self.workers);
        Dispatched::Spawned(tokio::spawn(async move {
            let _slot = slot;
            // The semaphore is never closed, so acquisition only fails if the
            // pool itself is gone; the task is dropped in that case.
            let Ok(_worker) = workers.acquire_owned().await else {
                return;
            };
            task.await;
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn spawned_tasks_run() {
        let pool = WorkerPool::new(2, 4);
        let done = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let done = Arc::clone(&done);
            match pool
                .dispatch(async move {
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await
            {
                Dispatched::Spawned(handle) => handles.push(handle),
                Dispatched::RanInline => panic!("queue should have room"),
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn concurrency_is_capped_at_pool_size() {
        let pool = WorkerPool::new(2, 16);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            if let Dispatched::Spawned(handle) = pool
                .dispatch(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            {
                handles.push(handle);
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn full_queue_runs_on_caller() {
        let pool = WorkerPool::new(1, 0);
        let gate = Arc::new(tokio::sync::Notify::new());

        let blocker = {
            let gate = Arc::clone(&gate);
            pool.dispatch(async move { gate.notified().await }).await
        };
        assert!(matches!(blocker, Dispatched::Spawned(_)));
        assert_eq!(pool.occupied(), 1);

        let ran = Arc::new(AtomicUsize::new(0));
        let inline = {
            let ran = Arc::clone(&ran);
            pool.dispatch(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .await
        };
        assert!(matches!(inline, Dispatched::RanInline));
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        gate.notify_one();
        if let Dispatched::Spawned(handle) = blocker {
            handle.await.unwrap();
        }
        assert_eq!(pool.occupied(), 0);
    }
}
