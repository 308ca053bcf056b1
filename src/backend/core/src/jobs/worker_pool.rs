//! Worker Pool - bounds concurrent job executors with a tokio Semaphore.
//!
//! The `WorkerPool` provides:
//! - A hard cap on concurrent executors (one permit per executor)
//! - Non-blocking permit acquisition for the dispatcher
//! - Executor tracking so shutdown can wait on every spawned task
//! - Pool statistics

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// A held executor slot. Releasing it wakes the dispatcher.
pub struct WorkerPermit {
    permit: Option<OwnedSemaphorePermit>,
    stats: Arc<PoolStats>,
    released: Arc<Notify>,
    started_at: Instant,
    finished: bool,
}

impl WorkerPermit {
    /// Mark this execution as successful.
    pub fn mark_success(mut self) {
        self.finished = true;
        self.stats.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
        self.stats.record_duration(self.started_at.elapsed());
    }

    /// Mark this execution as failed.
    pub fn mark_failure(mut self) {
        self.finished = true;
        self.stats.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.stats.record_duration(self.started_at.elapsed());
    }
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        // Dropped without an outcome: the executor was aborted or discarded its result
        if !self.finished {
            self.stats.tasks_unknown.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.current_concurrent.fetch_sub(1, Ordering::Relaxed);
        drop(self.permit.take());
        self.released.notify_one();
    }
}

/// Internal statistics tracking.
#[derive(Default)]
struct PoolStats {
    tasks_started: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_unknown: AtomicU64,
    total_exec_time_us: AtomicU64,
    peak_concurrent: AtomicUsize,
    current_concurrent: AtomicUsize,
}

impl PoolStats {
    fn record_acquire(&self) {
        self.tasks_started.fetch_add(1, Ordering::Relaxed);
        let current = self.current_concurrent.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_concurrent.fetch_max(current, Ordering::Relaxed);
    }

    fn record_duration(&self, duration: Duration) {
        self.total_exec_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }
}

/// Bounded pool of job executors.
pub struct WorkerPool {
    max_workers: usize,
    semaphore: Arc<Semaphore>,
    stats: Arc<PoolStats>,
    tracker: TaskTracker,
    released: Arc<Notify>,
    created_at: Instant,
}

impl WorkerPool {
    /// Create a pool of `max_workers` slots. `released` is notified whenever a slot frees up.
    pub fn new(max_workers: usize, released: Arc<Notify>) -> Self {
        tracing::debug!(max_workers, "Worker pool created");

        Self {
            max_workers,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            stats: Arc::new(PoolStats::default()),
            tracker: TaskTracker::new(),
            released,
            created_at: Instant::now(),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn active_workers(&self) -> usize {
        self.max_workers - self.semaphore.available_permits()
    }

    pub fn is_at_capacity(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Try to acquire an executor slot without waiting.
    pub fn try_acquire(&self) -> Option<WorkerPermit> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        self.stats.record_acquire();
        Some(WorkerPermit {
            permit: Some(permit),
            stats: self.stats.clone(),
            released: self.released.clone(),
            started_at: Instant::now(),
            finished: false,
        })
    }

    /// Spawn an executor. The future owns its permit and releases it when it finishes.
    pub fn spawn<Fut>(&self, future: Fut) -> JoinHandle<()>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(future)
    }

    /// Stop accepting the pool as "open"; `wait` resolves once every executor exits.
    pub fn close(&self) {
        self.tracker.close();
    }

    /// Wait for every spawned executor. Resolves only after `close`.
    pub async fn wait(&self) {
        self.tracker.wait().await
    }

    /// Number of executors still alive.
    pub fn live_tasks(&self) -> usize {
        self.tracker.len()
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let stats = &self.stats;
        let tasks_succeeded = stats.tasks_succeeded.load(Ordering::Relaxed);
        let tasks_failed = stats.tasks_failed.load(Ordering::Relaxed);
        let total_completed = tasks_succeeded + tasks_failed;

        let avg_exec_time_us = if total_completed > 0 {
            stats.total_exec_time_us.load(Ordering::Relaxed) / total_completed
        } else {
            0
        };

        WorkerPoolStats {
            max_workers: self.max_workers,
            available_permits: self.semaphore.available_permits(),
            active_workers: self.active_workers(),
            tasks_started: stats.tasks_started.load(Ordering::Relaxed),
            tasks_succeeded,
            tasks_failed,
            tasks_unknown: stats.tasks_unknown.load(Ordering::Relaxed),
            peak_concurrent: stats.peak_concurrent.load(Ordering::Relaxed),
            avg_exec_time_us,
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.max_workers)
            .field("available_permits", &self.available_permits())
            .field("live_tasks", &self.live_tasks())
            .finish()
    }
}

/// Public statistics for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolStats {
    pub max_workers: usize,
    pub available_permits: usize,
    pub active_workers: usize,
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    /// Executors that ended without reporting an outcome
    pub tasks_unknown: u64,
    pub peak_concurrent: usize,
    pub avg_exec_time_us: u64,
    pub uptime_secs: u64,
}

impl WorkerPoolStats {
    /// Pool utilization, 0.0 to 1.0.
    pub fn utilization(&self) -> f64 {
        if self.max_workers == 0 {
            return 0.0;
        }
        self.active_workers as f64 / self.max_workers as f64
    }
}
