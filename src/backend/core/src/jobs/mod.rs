//! In-process background job manager.
//!
//! - **Queue**: bounded priority queue, FIFO within a priority level
//! - **Dispatcher**: single task feeding a semaphore-bounded worker pool
//! - **Retry**: exponential backoff with a priority boost per retry
//! - **Monitor**: stuck-job detection, retention sweep and statistics
//! - **Audit**: fire-and-forget lifecycle events
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             JobManager                               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  submit ──▶ ┌───────────────┐   ┌────────────┐   ┌────────────────┐  │
//! │             │ PriorityQueue │──▶│ Dispatcher │──▶│  Worker Pool   │  │
//! │             └───────────────┘   └────────────┘   │  (executors)   │  │
//! │                     ▲                            └────────────────┘  │
//! │                     │  due                               │           │
//! │             ┌───────────────┐     transient failure      │           │
//! │             │RetryScheduler │◀───────────────────────────┤           │
//! │             └───────────────┘                            ▼           │
//! │  ┌─────────┐                                     ┌───────────────┐   │
//! │  │ Monitor │──── stuck / sweep / stats ─────────▶│  JobRegistry  │   │
//! │  └─────────┘                                     └───────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use conveyor_core::config::JobManagerConfig;
//! use conveyor_core::jobs::{handler_fn, JobManager, JobPriority, JobRequest};
//!
//! let manager = JobManager::new(JobManagerConfig::default())?;
//! manager.register_handler("thumbnail", handler_fn(|ctx| async move {
//!     let path = ctx.payload().get("path").cloned().unwrap_or_default();
//!     Ok(serde_json::json!({ "thumbnail_for": path }))
//! }));
//! manager.start()?;
//!
//! let id = manager.submit(
//!     JobRequest::new("thumbnail")
//!         .with_priority(JobPriority::High)
//!         .with_field("path", "/uploads/cat.png"),
//! )?;
//! let status = manager.get_job_status(id)?;
//! let report = manager.stop().await;
//! ```

pub mod audit;
pub mod handler;
pub mod job;
pub mod manager;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod worker_pool;

mod dispatcher;

pub use audit::{AuditEvent, AuditOutcome, AuditSink, ChannelAuditSink, TracingAuditSink};
pub use handler::{handler_fn, FnHandler, HandlerTable, JobHandler};
pub use job::{
    JobContext, JobError, JobId, JobMetadata, JobPayload, JobPriority, JobResult, JobStatus,
    ProgressCell,
};
pub use manager::{JobFilter, JobManager, JobRequest, JobStatistics, ShutdownReport};
pub use monitor::MonitorReport;
pub use queue::{PriorityQueue, QueueStats};
pub use registry::{JobRegistry, RunningJob, SweepResult};
pub use retry::{BackoffStrategy, RetryScheduler};
pub use worker_pool::{WorkerPermit, WorkerPool, WorkerPoolStats};

// Built-in jobs
mod builtin;
pub use builtin::{
    register_builtin_handlers, DelayJob, DelayPayload, EchoJob, FailJob, FailPayload,
};
