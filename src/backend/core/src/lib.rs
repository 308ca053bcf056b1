#![allow(clippy::result_large_err)]
//! # Conveyor Core
//!
//! In-process background job manager.
//!
//! ## Architecture
//!
//! - **Jobs**: priority queue, dispatcher, worker pool, retries and monitor
//! - **Config**: layered file and environment configuration
//! - **Telemetry**: structured logging and Prometheus metrics
//! - **Error**: shared error codes and the crate-wide `Result`

pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{ConveyorError, ErrorCode, ErrorDetails, ErrorSeverity, Result, ResultExt};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, JobManagerConfig};
    pub use crate::error::{ConveyorError, ErrorCode, Result};
    pub use crate::jobs::{
        handler_fn, BackoffStrategy, JobContext, JobError, JobFilter, JobHandler, JobId,
        JobManager, JobMetadata, JobPriority, JobRequest, JobResult, JobStatistics, JobStatus,
        ShutdownReport,
    };
}
