//! Running, completed and failed partitions of the job registry.
//!
//! CANCELLED jobs live in the failed partition; both are swept on the
//! failed-retention window.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{JobId, JobMetadata, JobStatus, ProgressCell};
use crate::error::ErrorCode;

/// Bookkeeping for a job held by an executor.
#[derive(Debug)]
pub struct RunningJob {
    pub metadata: JobMetadata,
    pub token: CancellationToken,
    pub progress: ProgressCell,
    /// Set by the dispatcher once the executor task is spawned
    pub abort: Option<AbortHandle>,
    /// When cooperative cancellation was signalled, with the kind to record
    /// if the grace period runs out
    pub cancel_requested: Option<(Instant, ErrorCode)>,
}

impl RunningJob {
    pub fn new(metadata: JobMetadata) -> Self {
        Self {
            metadata,
            token: CancellationToken::new(),
            progress: ProgressCell::new(),
            abort: None,
            cancel_requested: None,
        }
    }

    /// Signal cooperative cancellation. Returns false if it was already signalled.
    pub fn request_cancel(&mut self, kind: ErrorCode, now: Instant) -> bool {
        if self.cancel_requested.is_some() {
            return false;
        }
        self.cancel_requested = Some((now, kind));
        self.metadata.cancel_requested = true;
        self.token.cancel();
        true
    }

    /// Metadata snapshot with the live progress folded in.
    pub fn snapshot(&self) -> JobMetadata {
        let mut metadata = self.metadata.clone();
        metadata.progress = self.progress.get();
        metadata
    }

    /// Abort the executor task at its next await point.
    pub fn abort(&self) {
        if let Some(handle) = &self.abort {
            handle.abort();
        }
    }
}

/// Jobs evicted by one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepResult {
    pub completed: usize,
    pub failed: usize,
}

impl SweepResult {
    pub fn total(&self) -> usize {
        self.completed + self.failed
    }
}

/// Registry of every job that has left the pending queue.
#[derive(Debug, Default)]
pub struct JobRegistry {
    running: HashMap<JobId, RunningJob>,
    completed: HashMap<JobId, JobMetadata>,
    failed: HashMap<JobId, JobMetadata>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_running(&mut self, job: RunningJob) {
        self.running.insert(job.metadata.job_id, job);
    }

    pub fn running(&self, id: &JobId) -> Option<&RunningJob> {
        self.running.get(id)
    }

    pub fn running_mut(&mut self, id: &JobId) -> Option<&mut RunningJob> {
        self.running.get_mut(id)
    }

    pub fn take_running(&mut self, id: &JobId) -> Option<RunningJob> {
        self.running.remove(id)
    }

    pub fn running_jobs(&self) -> impl Iterator<Item = &RunningJob> {
        self.running.values()
    }

    pub fn running_jobs_mut(&mut self) -> impl Iterator<Item = &mut RunningJob> {
        self.running.values_mut()
    }

    /// File a job that reached a terminal state.
    pub fn finish(&mut self, job: JobMetadata) {
        debug_assert!(job.status.is_terminal());
        match job.status {
            JobStatus::Completed => {
                self.completed.insert(job.job_id, job);
            }
            _ => {
                self.failed.insert(job.job_id, job);
            }
        }
    }

    pub fn get(&self, id: &JobId) -> Option<JobMetadata> {
        if let Some(job) = self.running.get(id) {
            return Some(job.snapshot());
        }
        self.completed
            .get(id)
            .or_else(|| self.failed.get(id))
            .cloned()
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.running.contains_key(id) || self.completed.contains_key(id) || self.failed.contains_key(id)
    }

    /// Snapshot of every job in the three partitions.
    pub fn snapshots(&self) -> impl Iterator<Item = JobMetadata> + '_ {
        self.running
            .values()
            .map(RunningJob::snapshot)
            .chain(self.completed.values().cloned())
            .chain(self.failed.values().cloned())
    }

    pub fn completed_jobs(&self) -> impl Iterator<Item = &JobMetadata> {
        self.completed.values()
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobMetadata> {
        self.failed.values()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// FAILED and CANCELLED jobs.
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Evict terminal jobs whose `completed_at` is older than their retention window.
    pub fn sweep(
        &mut self,
        now: DateTime<Utc>,
        completed_retention: Duration,
        failed_retention: Duration,
    ) -> SweepResult {
        let expired = |job: &JobMetadata, retention: Duration| {
            job.completed_at
                .and_then(|at| (now - at).to_std().ok())
                .is_some_and(|age| age > retention)
        };

        let before_completed = self.completed.len();
        self.completed.retain(|_, job| !expired(job, completed_retention));
        let before_failed = self.failed.len();
        self.failed.retain(|_, job| !expired(job, failed_retention));

        SweepResult {
            completed: before_completed - self.completed.len(),
            failed: before_failed - self.failed.len(),
        }
    }
}
