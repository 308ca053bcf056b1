//! Built-in job handlers used by the demo binary and integration tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{JobContext, JobError, JobHandler, JobManager, JobResult};

/// Job: Return the payload unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoJob;

impl EchoJob {
    pub const JOB_TYPE: &'static str = "echo";
}

#[async_trait]
impl JobHandler for EchoJob {
    async fn handle(&self, ctx: JobContext) -> JobResult {
        ctx.report_progress(100.0);
        Ok(serde_json::Value::Object(ctx.payload().clone()))
    }
}

/// Payload for [`DelayJob`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayPayload {
    /// Total time to sleep (milliseconds)
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    /// Number of progress reports spread over the sleep
    #[serde(default = "default_steps")]
    pub steps: u32,
}

fn default_duration_ms() -> u64 {
    1000
}

fn default_steps() -> u32 {
    10
}

/// Job: Sleep for `duration_ms`, reporting progress and honoring cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayJob;

impl DelayJob {
    pub const JOB_TYPE: &'static str = "delay";
}

#[async_trait]
impl JobHandler for DelayJob {
    async fn handle(&self, ctx: JobContext) -> JobResult {
        let payload: DelayPayload = ctx.parse_payload()?;
        let steps = payload.steps.max(1);
        let step = Duration::from_millis(payload.duration_ms) / steps;

        for done in 1..=steps {
            if ctx.cancellable(tokio::time::sleep(step)).await.is_none() {
                ctx.log_warn("Delay interrupted by cancellation");
                return Err(JobError::permanent("delay interrupted").with_code("cancelled"));
            }
            ctx.report_progress(done as f32 * 100.0 / steps as f32);
        }

        Ok(serde_json::json!({ "slept_ms": payload.duration_ms }))
    }
}

/// Payload for [`FailJob`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailPayload {
    #[serde(default)]
    pub permanent: bool,
    #[serde(default = "default_fail_message")]
    pub message: String,
}

fn default_fail_message() -> String {
    "requested failure".to_string()
}

/// Job: Always fail, transiently unless `permanent` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailJob;

impl FailJob {
    pub const JOB_TYPE: &'static str = "fail";
}

#[async_trait]
impl JobHandler for FailJob {
    async fn handle(&self, ctx: JobContext) -> JobResult {
        let payload: FailPayload = ctx.parse_payload()?;
        if payload.permanent {
            Err(JobError::permanent(payload.message))
        } else {
            Err(JobError::retryable(payload.message))
        }
    }
}

/// Register every built-in handler under its job type.
pub fn register_builtin_handlers(manager: &JobManager) {
    manager.register_handler(EchoJob::JOB_TYPE, EchoJob);
    manager.register_handler(DelayJob::JOB_TYPE, DelayJob);
    manager.register_handler(FailJob::JOB_TYPE, FailJob);
}
