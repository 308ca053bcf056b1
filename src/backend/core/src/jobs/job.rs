//! Job definitions.
//!
//! This module provides the core data model for background jobs:
//!
//! - **JobId**: Opaque unique identifier assigned at submission
//! - **JobStatus** / **JobPriority**: Lifecycle state and scheduling weight
//! - **JobMetadata**: The record the manager keeps for every job
//! - **JobError**: Failure reported by a handler, transient or permanent
//! - **JobContext**: What a handler receives for one execution attempt

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ConveyorError, ErrorCode};

/// JSON object handed to a handler on every attempt.
pub type JobPayload = serde_json::Map<String, serde_json::Value>;

/// Result type returned by handlers.
pub type JobResult = std::result::Result<serde_json::Value, JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the priority queue
    Pending,
    /// Held by an executor
    Running,
    /// Failed, waiting out its backoff before going back to the queue
    Retrying,
    /// Handler returned successfully
    Completed,
    /// Failed permanently or exhausted its retries
    Failed,
    /// Cancelled before or during execution
    Cancelled,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Retrying => write!(f, "retrying"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority level for jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    /// Processed when nothing else is waiting
    Low = 0,
    /// Default for most jobs
    #[default]
    Normal = 1,
    /// Processed before normal jobs
    High = 2,
    /// Processed before everything else
    Critical = 3,
}

impl JobPriority {
    /// All levels, lowest first.
    pub const ALL: [JobPriority; 4] = [Self::Low, Self::Normal, Self::High, Self::Critical];

    /// The next level up, saturating at `Critical`.
    pub fn boosted(self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for job execution failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether this error is retryable
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
    /// Additional context
    pub context: Option<serde_json::Value>,
}

impl JobError {
    /// Create a transient error. Transient errors are retried up to `max_retries`.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
            context: None,
        }
    }

    /// Create a permanent error. The job fails without further retries.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
            context: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add context.
    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }

    /// The manager-side classification of this failure.
    pub fn error_code(&self) -> ErrorCode {
        if self.retryable {
            ErrorCode::TransientExecution
        } else {
            ErrorCode::PermanentExecution
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<ConveyorError> for JobError {
    fn from(error: ConveyorError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().as_str().to_string()),
            context: None,
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(error: serde_json::Error) -> Self {
        Self::permanent(format!("invalid payload: {}", error)).with_code("invalid_payload")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Metadata
// ═══════════════════════════════════════════════════════════════════════════════

/// The record the manager keeps for one job.
///
/// Callers only ever see clones; the manager's copy is the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub job_id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    /// Current priority. Raised by one level on every retry.
    pub priority: JobPriority,
    pub created_at: DateTime<Utc>,
    /// Start of the current attempt
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    /// Machine-readable classification of the last failure
    pub error_kind: Option<String>,
    /// Handler-reported, 0 to 100
    pub progress: f32,
    pub result: Option<serde_json::Value>,
    pub owner_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub payload: JobPayload,
    /// Set once cooperative cancellation was signalled while running
    pub cancel_requested: bool,
    /// When a retrying job becomes pending again
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl JobMetadata {
    /// Create metadata for a freshly submitted job.
    pub fn new(job_type: impl Into<String>, priority: JobPriority, max_retries: u32) -> Self {
        Self {
            job_id: JobId::new(),
            job_type: job_type.into(),
            status: JobStatus::Pending,
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            error_message: None,
            error_kind: None,
            progress: 0.0,
            result: None,
            owner_id: None,
            resource_type: None,
            resource_id: None,
            payload: JobPayload::new(),
            cancel_requested: false,
            next_retry_at: None,
        }
    }

    /// Transition PENDING → RUNNING.
    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    /// Transition RUNNING → COMPLETED.
    pub fn mark_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.progress = 100.0;
        self.finish(now);
    }

    /// Transition RUNNING → RETRYING, consuming one retry.
    ///
    /// Callers must check `can_retry()` first.
    pub fn mark_retrying(&mut self, error: &str, kind: ErrorCode, retry_at: DateTime<Utc>) {
        debug_assert!(self.can_retry());
        self.retry_count += 1;
        self.status = JobStatus::Retrying;
        self.error_message = Some(error.to_string());
        self.error_kind = Some(kind.as_str().to_string());
        self.next_retry_at = Some(retry_at);
    }

    /// Transition RETRYING → PENDING at a boosted priority.
    pub fn reset_for_retry(&mut self) {
        self.status = JobStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.progress = 0.0;
        self.next_retry_at = None;
        self.cancel_requested = false;
        self.priority = self.priority.boosted();
    }

    /// Transition to FAILED.
    pub fn mark_failed(&mut self, error: &str, kind: ErrorCode, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error_message = Some(error.to_string());
        self.error_kind = Some(kind.as_str().to_string());
        self.finish(now);
    }

    /// Transition to CANCELLED.
    pub fn mark_cancelled(&mut self, reason: &str, kind: ErrorCode, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.error_message = Some(reason.to_string());
        self.error_kind = Some(kind.as_str().to_string());
        self.next_retry_at = None;
        self.finish(now);
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        if self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
    }

    /// Whether another attempt is allowed after a transient failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Processing time of the last attempt, once finished.
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Progress cell shared between a handler and the registry.
///
/// Stores the f32 bit pattern so handlers can report without taking a lock.
#[derive(Debug, Clone, Default)]
pub struct ProgressCell(Arc<AtomicU32>);

impl ProgressCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, percent: f32) {
        let clamped = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 100.0) };
        self.0.store(clamped.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Context passed to a handler for one execution attempt.
pub struct JobContext {
    /// Snapshot of the job at dispatch time
    pub metadata: JobMetadata,
    cancellation: CancellationToken,
    progress: ProgressCell,
}

impl JobContext {
    pub fn new(metadata: JobMetadata, cancellation: CancellationToken, progress: ProgressCell) -> Self {
        Self {
            metadata,
            cancellation,
            progress,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.metadata.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.metadata.job_type
    }

    pub fn payload(&self) -> &JobPayload {
        &self.metadata.payload
    }

    /// Deserialize the payload into a typed value.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> std::result::Result<T, JobError> {
        let value = serde_json::Value::Object(self.metadata.payload.clone());
        Ok(serde_json::from_value(value)?)
    }

    /// Current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.metadata.retry_count + 1
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Run a future, giving up early if cancellation is requested.
    pub async fn cancellable<F, T>(&self, future: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            result = future => Some(result),
            _ = self.cancellation.cancelled() => None,
        }
    }

    /// Report progress (clamped to 0..=100).
    pub fn report_progress(&self, percent: f32) {
        self.progress.set(percent);
    }

    /// Log a message associated with this job.
    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.metadata.job_id,
            job_type = %self.metadata.job_type,
            attempt = self.attempt(),
            message
        );
    }

    /// Log a warning associated with this job.
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.metadata.job_id,
            job_type = %self.metadata.job_type,
            attempt = self.attempt(),
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
