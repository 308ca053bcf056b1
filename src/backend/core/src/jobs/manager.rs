//! The job manager: submission, lookup, cancellation and shutdown.
//!
//! [`JobManager`] is a cheap `Clone` handle. Queue, retry heap and registry
//! live together behind one `parking_lot::Mutex` that is never held across an
//! `.await`; handlers and the audit sink always run outside it.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::audit::{AuditEvent, AuditOutcome, AuditSink, TracingAuditSink};
use super::handler::{HandlerTable, JobHandler};
use super::monitor::{self, MonitorReport};
use super::queue::PriorityQueue;
use super::registry::JobRegistry;
use super::retry::RetryScheduler;
use super::worker_pool::{WorkerPool, WorkerPoolStats};
use super::{dispatcher, JobId, JobMetadata, JobPayload, JobPriority, JobStatus};
use crate::config::JobManagerConfig;
use crate::error::{ConveyorError, ErrorCode, Result};
use crate::telemetry::JobMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Requests and Filters
// ═══════════════════════════════════════════════════════════════════════════════

/// A job submission.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub job_type: String,
    pub priority: JobPriority,
    pub owner_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub payload: JobPayload,
    /// Overrides `default_max_retries`
    pub max_retries: Option<u32>,
}

impl JobRequest {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_payload(mut self, payload: JobPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Set a single payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    fn into_metadata(self, default_max_retries: u32) -> JobMetadata {
        let mut job = JobMetadata::new(
            self.job_type,
            self.priority,
            self.max_retries.unwrap_or(default_max_retries),
        );
        job.owner_id = self.owner_id;
        job.resource_type = self.resource_type;
        job.resource_id = self.resource_id;
        job.payload = self.payload;
        job
    }
}

/// Criteria for [`JobManager::find_jobs`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub owner_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub job_type: Option<String>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, job: &JobMetadata) -> bool {
        fn matches_opt(want: &Option<String>, have: &Option<String>) -> bool {
            want.as_ref().map_or(true, |w| have.as_ref() == Some(w))
        }

        matches_opt(&self.owner_id, &job.owner_id)
            && matches_opt(&self.resource_type, &job.resource_type)
            && matches_opt(&self.resource_id, &job.resource_id)
            && self.job_type.as_ref().map_or(true, |t| *t == job.job_type)
            && self.status.map_or(true, |s| s == job.status)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics and Reports
// ═══════════════════════════════════════════════════════════════════════════════

/// Aggregate view of the manager.
///
/// Terminal counts cover retained jobs only; `total_submitted` is lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub total_submitted: u64,
    pub queue_depth: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub max_workers: usize,
    /// Mean of `completed_at - started_at` over retained completed jobs
    #[serde(with = "humantime_serde")]
    pub avg_processing_time: Duration,
    pub refreshed_at: DateTime<Utc>,
}

impl JobStatistics {
    fn compute(state: &ManagerState, max_workers: usize, total_submitted: u64) -> Self {
        let (mut failed, mut cancelled) = (0, 0);
        for job in state.registry.failed_jobs() {
            match job.status {
                JobStatus::Cancelled => cancelled += 1,
                _ => failed += 1,
            }
        }

        let durations: Vec<Duration> = state
            .registry
            .completed_jobs()
            .filter_map(|job| job.processing_time())
            .filter_map(|elapsed| elapsed.to_std().ok())
            .collect();
        let avg_processing_time = match u32::try_from(durations.len()) {
            Ok(count) if count > 0 => durations.iter().sum::<Duration>() / count,
            _ => Duration::ZERO,
        };

        Self {
            total_submitted,
            queue_depth: state.queue.len(),
            running: state.registry.running_count(),
            retrying: state.retries.len(),
            completed: state.registry.completed_count(),
            failed,
            cancelled,
            max_workers,
            avg_processing_time,
            refreshed_at: Utc::now(),
        }
    }

    /// Jobs not yet in a terminal state.
    pub fn in_flight(&self) -> usize {
        self.queue_depth + self.running + self.retrying
    }
}

/// Outcome of [`JobManager::stop`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// PENDING and RETRYING jobs cancelled without running
    pub cancelled_pending: usize,
    /// RUNNING jobs that received the cooperative cancel signal
    pub signalled_running: usize,
    /// Jobs still executing when the timeout expired
    pub abandoned: Vec<JobId>,
    pub timed_out: bool,
    /// The manager had already been stopped; nothing was done
    pub already_stopped: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Shared State
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Idle,
    Running,
    Stopping,
    Stopped,
}

pub(crate) struct ManagerState {
    pub lifecycle: Lifecycle,
    pub queue: PriorityQueue,
    pub registry: JobRegistry,
    pub retries: RetryScheduler,
}

pub(crate) struct Shared {
    pub config: JobManagerConfig,
    pub state: Mutex<ManagerState>,
    pub handlers: RwLock<HandlerTable>,
    /// Wakes the dispatcher on new work or a freed worker
    pub wakeup: Arc<Notify>,
    /// Wakes the monitor when a RUNNING job is signalled to cancel
    pub cancel_signalled: Notify,
    pub pool: WorkerPool,
    pub shutdown: CancellationToken,
    audit: Arc<dyn AuditSink>,
    total_submitted: AtomicU64,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    pub fn emit(&self, events: Vec<AuditEvent>) {
        for event in events {
            self.audit.record(event);
        }
    }

    pub fn compute_statistics(&self) -> JobStatistics {
        let state = self.state.lock();
        JobStatistics::compute(
            &state,
            self.config.max_workers,
            self.total_submitted.load(Ordering::Relaxed),
        )
    }

    /// Recompute statistics and publish them as gauges.
    pub fn refresh_statistics(&self) -> JobStatistics {
        let stats = self.compute_statistics();
        JobMetrics::set_queue_depth(stats.queue_depth);
        JobMetrics::set_running(stats.running);
        JobMetrics::set_retrying(stats.retrying);
        stats
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Manager
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority-queued background job manager.
///
/// ```rust,ignore
/// let manager = JobManager::new(JobManagerConfig::default())?;
/// manager.register_handler("echo", EchoJob);
/// manager.start()?;
///
/// let id = manager.submit(JobRequest::new("echo").with_field("message", "hi"))?;
/// let report = manager.stop().await;
/// ```
#[derive(Clone)]
pub struct JobManager {
    shared: Arc<Shared>,
}

impl JobManager {
    /// Create a manager that audits to the `conveyor::audit` tracing target.
    pub fn new(config: JobManagerConfig) -> Result<Self> {
        Self::with_audit_sink(config, Arc::new(TracingAuditSink))
    }

    pub fn with_audit_sink(config: JobManagerConfig, audit: Arc<dyn AuditSink>) -> Result<Self> {
        config.validate()?;

        let wakeup = Arc::new(Notify::new());
        let shared = Shared {
            state: Mutex::new(ManagerState {
                lifecycle: Lifecycle::Idle,
                queue: PriorityQueue::new(config.max_queue_size),
                registry: JobRegistry::new(),
                retries: RetryScheduler::new(),
            }),
            handlers: RwLock::new(HandlerTable::new()),
            pool: WorkerPool::new(config.max_workers, wakeup.clone()),
            wakeup,
            cancel_signalled: Notify::new(),
            shutdown: CancellationToken::new(),
            audit,
            total_submitted: AtomicU64::new(0),
            loops: Mutex::new(Vec::new()),
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.shared.config
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Register the handler for a job type. Returns true if it replaced another.
    pub fn register_handler<H>(&self, job_type: impl Into<String>, handler: H) -> bool
    where
        H: JobHandler + 'static,
    {
        let job_type = job_type.into();
        let replaced = self
            .shared
            .handlers
            .write()
            .insert(job_type.clone(), Arc::new(handler))
            .is_some();
        if replaced {
            warn!(job_type = %job_type, "Handler replaced");
        } else {
            debug!(job_type = %job_type, "Handler registered");
        }
        replaced
    }

    /// Job types with a registered handler, sorted.
    pub fn handler_types(&self) -> Vec<String> {
        self.shared.handlers.read().job_types()
    }

    /// Spawn the dispatcher and monitor. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            match state.lifecycle {
                Lifecycle::Idle => state.lifecycle = Lifecycle::Running,
                Lifecycle::Running => return Err(ConveyorError::already_started()),
                Lifecycle::Stopping | Lifecycle::Stopped => return Err(ConveyorError::shutting_down()),
            }
        }

        let dispatcher = tokio::spawn(dispatcher::run(self.shared.clone()));
        let monitor = tokio::spawn(monitor::run(self.shared.clone()));
        self.shared.loops.lock().extend([dispatcher, monitor]);

        info!(
            max_workers = self.shared.config.max_workers,
            max_queue_size = self.shared.config.max_queue_size,
            handlers = ?self.handler_types(),
            "Job manager started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().lifecycle == Lifecycle::Running
    }

    /// Enqueue a job.
    ///
    /// Fails with `QueueFull` when the pending queue is at capacity and with
    /// `ShuttingDown` once `stop()` has been called. Jobs submitted before
    /// `start()` wait in the queue.
    pub fn submit(&self, request: JobRequest) -> Result<JobId> {
        let job = request.into_metadata(self.shared.config.default_max_retries);
        let job_id = job.job_id;
        let job_type = job.job_type.clone();
        let priority = job.priority;

        {
            let mut state = self.shared.state.lock();
            if matches!(state.lifecycle, Lifecycle::Stopping | Lifecycle::Stopped) {
                return Err(ConveyorError::shutting_down());
            }
            if let Err(error) = state.queue.push(job) {
                drop(state);
                JobMetrics::rejected(&job_type);
                warn!(job_type = %job_type, priority = %priority, "Job rejected: queue full");
                return Err(error);
            }
        }

        self.shared.total_submitted.fetch_add(1, Ordering::Relaxed);
        JobMetrics::submitted(&job_type, priority.as_str());
        debug!(job_id = %job_id, job_type = %job_type, priority = %priority, "Job submitted");
        self.shared.wakeup.notify_one();
        Ok(job_id)
    }

    /// Latest snapshot of a job, wherever it currently lives.
    pub fn get_job_status(&self, job_id: JobId) -> Result<JobMetadata> {
        let state = self.shared.state.lock();
        state
            .queue
            .get(&job_id)
            .or_else(|| state.retries.get(&job_id))
            .cloned()
            .or_else(|| state.registry.get(&job_id))
            .ok_or_else(|| ConveyorError::job_not_found(job_id))
    }

    /// Cancel a job.
    ///
    /// PENDING and RETRYING jobs are cancelled immediately. RUNNING jobs are
    /// signalled and finish as CANCELLED when the handler acknowledges, or
    /// are forced after the grace period. Returns false for unknown or
    /// terminal jobs.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let now = Utc::now();
        let event = {
            let mut state = self.shared.state.lock();

            let waiting = match state.queue.remove(&job_id) {
                Some(job) => Some((job, "cancelled before dispatch")),
                None => state
                    .retries
                    .remove(&job_id)
                    .map(|job| (job, "cancelled while waiting to retry")),
            };

            match waiting {
                Some((mut job, reason)) => {
                    job.mark_cancelled(reason, ErrorCode::JobCancelled, now);
                    JobMetrics::cancelled(&job.job_type, ErrorCode::JobCancelled.as_str());
                    info!(job_id = %job_id, job_type = %job.job_type, "Job cancelled");
                    let event = AuditEvent::from_job(&job, AuditOutcome::Cancelled);
                    state.registry.finish(job);
                    event
                }
                None => {
                    return match state.registry.running_mut(&job_id) {
                        Some(running) => {
                            if running.request_cancel(ErrorCode::JobCancelled, Instant::now()) {
                                info!(
                                    job_id = %job_id,
                                    job_type = %running.metadata.job_type,
                                    "Cancellation requested for running job"
                                );
                                self.shared.cancel_signalled.notify_one();
                            }
                            true
                        }
                        None => false,
                    };
                }
            }
        };

        self.shared.emit(vec![event]);
        true
    }

    /// The newest `limit` jobs across the running, completed and failed partitions.
    pub fn get_recent(&self, limit: usize) -> Vec<JobMetadata> {
        let mut jobs: Vec<JobMetadata> = self.shared.state.lock().registry.snapshots().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        jobs
    }

    /// Every known job matching `filter`, newest first.
    pub fn find_jobs(&self, filter: &JobFilter) -> Vec<JobMetadata> {
        let mut jobs: Vec<JobMetadata> = {
            let state = self.shared.state.lock();
            state
                .queue
                .iter()
                .chain(state.retries.iter())
                .cloned()
                .chain(state.registry.snapshots())
                .filter(|job| filter.matches(job))
                .collect()
        };
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Fresh statistics.
    pub fn get_statistics(&self) -> JobStatistics {
        self.shared.refresh_statistics()
    }

    pub fn pool_stats(&self) -> WorkerPoolStats {
        self.shared.pool.stats()
    }

    /// Run one monitor cycle now: stuck detection, grace enforcement,
    /// retention sweep and statistics refresh.
    pub fn run_monitor_cycle(&self) -> MonitorReport {
        monitor::run_cycle(&self.shared)
    }

    /// Stop the manager.
    ///
    /// Cancels every PENDING and RETRYING job, signals every RUNNING job and
    /// waits up to `shutdown_timeout` for the loops and executors to exit.
    /// Jobs still running after that are abandoned. A second call is a no-op.
    pub async fn stop(&self) -> ShutdownReport {
        let shared = &self.shared;
        let now = Utc::now();

        let (cancelled_pending, signalled_running, events) = {
            let mut state = shared.state.lock();
            if matches!(state.lifecycle, Lifecycle::Stopping | Lifecycle::Stopped) {
                debug!("Job manager already stopped");
                return ShutdownReport {
                    already_stopped: true,
                    ..Default::default()
                };
            }
            state.lifecycle = Lifecycle::Stopping;

            let mut waiting = state.queue.drain();
            waiting.extend(state.retries.drain());
            let cancelled_pending = waiting.len();

            let mut events = Vec::with_capacity(waiting.len());
            for mut job in waiting {
                job.mark_cancelled("cancelled by shutdown", ErrorCode::ShuttingDown, now);
                JobMetrics::cancelled(&job.job_type, ErrorCode::ShuttingDown.as_str());
                events.push(AuditEvent::from_job(&job, AuditOutcome::Cancelled));
                state.registry.finish(job);
            }

            let signalled_at = Instant::now();
            let mut signalled_running = 0;
            for running in state.registry.running_jobs_mut() {
                running.request_cancel(ErrorCode::ShuttingDown, signalled_at);
                signalled_running += 1;
            }

            (cancelled_pending, signalled_running, events)
        };

        info!(
            cancelled_pending,
            signalled_running,
            timeout = ?shared.config.shutdown_timeout,
            "Job manager stopping"
        );

        shared.shutdown.cancel();
        shared.wakeup.notify_waiters();
        shared.emit(events);
        shared.pool.close();

        let loops: Vec<JoinHandle<()>> = shared.loops.lock().drain(..).collect();
        let joined = tokio::time::timeout(shared.config.shutdown_timeout, async {
            for handle in loops {
                if let Err(join_error) = handle.await {
                    error!(error = %join_error, "Job manager loop ended abnormally");
                }
            }
            shared.pool.wait().await;
        })
        .await
        .is_ok();

        let (abandoned, events) = {
            let mut state = shared.state.lock();
            let ids: Vec<JobId> = state
                .registry
                .running_jobs()
                .map(|running| running.metadata.job_id)
                .collect();

            let mut events = Vec::with_capacity(ids.len());
            let now = Utc::now();
            for id in &ids {
                if let Some(running) = state.registry.take_running(id) {
                    running.abort();
                    let mut job = running.snapshot();
                    job.mark_cancelled("abandoned at shutdown", ErrorCode::ShuttingDown, now);
                    warn!(
                        job_id = %id,
                        job_type = %job.job_type,
                        "Abandoning job still running after shutdown timeout"
                    );
                    JobMetrics::cancelled(&job.job_type, ErrorCode::ShuttingDown.as_str());
                    events.push(AuditEvent::from_job(&job, AuditOutcome::Cancelled));
                    state.registry.finish(job);
                }
            }
            state.lifecycle = Lifecycle::Stopped;
            (ids, events)
        };
        shared.emit(events);
        let stats = shared.refresh_statistics();

        info!(
            timed_out = !joined,
            abandoned = abandoned.len(),
            completed = stats.completed,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "Job manager stopped"
        );

        ShutdownReport {
            cancelled_pending,
            signalled_running,
            abandoned,
            timed_out: !joined,
            already_stopped: false,
        }
    }

    /// Start (if needed), wait for `signal`, then stop.
    pub async fn run_until<F>(&self, signal: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ()>,
    {
        if !self.is_running() {
            self.start()?;
        }
        signal.await;
        info!("Shutdown signal received");
        Ok(self.stop().await)
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("lifecycle", &self.shared.state.lock().lifecycle)
            .field("pool", &self.shared.pool)
            .finish()
    }
}
