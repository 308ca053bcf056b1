//! Job lifecycle audit events.
//!
//! Emission is fire-and-forget: sinks must never block the caller, and a full
//! or closed sink drops the event rather than failing the job.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{JobId, JobMetadata, JobPriority};

/// What happened to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Started,
    Completed,
    Retrying,
    Failed,
    Cancelled,
}

impl AuditOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub job_id: JobId,
    pub job_type: String,
    pub priority: JobPriority,
    pub outcome: AuditOutcome,
    /// 1-indexed attempt the event belongs to
    pub attempt: u32,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub owner_id: Option<String>,
}

impl AuditEvent {
    pub fn from_job(job: &JobMetadata, outcome: AuditOutcome) -> Self {
        let failed = !matches!(outcome, AuditOutcome::Started | AuditOutcome::Completed);
        Self {
            timestamp: Utc::now(),
            job_id: job.job_id,
            job_type: job.job_type.clone(),
            priority: job.priority,
            outcome,
            attempt: match outcome {
                // retry_count was already bumped for the failed attempt
                AuditOutcome::Retrying => job.retry_count,
                _ => job.retry_count + 1,
            },
            error_kind: failed.then(|| job.error_kind.clone()).flatten(),
            error_message: failed.then(|| job.error_message.clone()).flatten(),
            owner_id: job.owner_id.clone(),
        }
    }
}

/// Consumer of audit events. `record` must return promptly.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes events straight to the `conveyor::audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            target: "conveyor::audit",
            job_id = %event.job_id,
            job_type = %event.job_type,
            priority = %event.priority,
            outcome = %event.outcome,
            attempt = event.attempt,
            error_kind = event.error_kind.as_deref(),
            error = event.error_message.as_deref(),
            owner_id = event.owner_id.as_deref(),
            "AUDIT"
        );
    }
}

/// Hands events to a background task over a bounded channel.
///
/// Must be created inside a tokio runtime.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    sender: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    /// Spawn a receiver that forwards every event to `inner`.
    pub fn spawn<S>(buffer: usize, inner: S) -> Self
    where
        S: AuditSink + 'static,
    {
        let (sender, mut receiver) = mpsc::channel::<AuditEvent>(buffer.max(1));
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                inner.record(event);
            }
        });
        Self { sender }
    }

    /// Spawn a receiver that logs through [`TracingAuditSink`].
    pub fn tracing(buffer: usize) -> Self {
        Self::spawn(buffer, TracingAuditSink)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Err(error) = self.sender.try_send(event) {
            counter!("conveyor_audit_dropped_total").increment(1);
            warn!(error = %error, "Audit event dropped");
        }
    }
}
