//! Dispatch loop and job executor.
//!
//! One dispatcher task promotes due retries, pops the highest priority job
//! and hands it to a pooled executor. It never waits on an executor; when the
//! pool is full or the queue is empty it parks on the shared `Notify` with a
//! timeout.

use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use super::audit::{AuditEvent, AuditOutcome};
use super::manager::{Lifecycle, ManagerState, Shared};
use super::registry::RunningJob;
use super::worker_pool::WorkerPermit;
use super::{JobContext, JobError, JobId, JobMetadata, JobResult, JobStatus};
use crate::error::{ConveyorError, ErrorCode};
use crate::telemetry::JobMetrics;

/// What the dispatcher should do next.
enum Step {
    Stop,
    /// Queue is empty; wake no later than the next retry
    Idle(Option<Instant>),
    /// Work is waiting but every worker is busy
    Busy,
    Dispatch(Dispatch),
}

struct Dispatch {
    permit: WorkerPermit,
    ctx: JobContext,
    event: AuditEvent,
}

pub(crate) async fn run(shared: Arc<Shared>) {
    info!(max_workers = shared.pool.max_workers(), "Dispatcher started");

    loop {
        promote_due_retries(&shared);
        match next_step(&shared) {
            Step::Stop => break,
            Step::Dispatch(dispatch) => launch(&shared, dispatch),
            Step::Busy => {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = shared.wakeup.notified() => {}
                    _ = sleep(shared.config.dispatch_backoff) => {}
                }
            }
            Step::Idle(next_retry) => {
                let mut deadline = Instant::now() + shared.config.poll_interval;
                if let Some(due) = next_retry {
                    deadline = deadline.min(due);
                }
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = shared.wakeup.notified() => {}
                    _ = sleep_until(deadline) => {}
                }
            }
        }
    }

    info!("Dispatcher stopped");
}

/// Move every retry whose backoff has elapsed back into the queue.
fn promote_due_retries(shared: &Shared) {
    let now = Instant::now();
    let events = {
        let mut state = shared.state.lock();
        if state.lifecycle != Lifecycle::Running {
            return;
        }

        let mut events = Vec::new();
        for mut job in state.retries.pop_due(now) {
            job.reset_for_retry();
            debug!(
                job_id = %job.job_id,
                job_type = %job.job_type,
                priority = %job.priority,
                retry_count = job.retry_count,
                "Retry due, re-enqueued"
            );
            if let Err(job) = state.queue.push_unbounded(job) {
                let error = ConveyorError::internal(format!(
                    "retry of job {} collided with a queued copy",
                    job.job_id
                ));
                events.push(fail_internal(&mut state, job, &error));
            }
        }
        events
    };

    for event in &events {
        JobMetrics::failed(&event.job_type, ErrorCode::InternalError.as_str());
    }
    shared.emit(events);
}

/// Mark a job FAILED after a manager-internal inconsistency and file it.
fn fail_internal(
    state: &mut ManagerState,
    mut job: JobMetadata,
    error: &ConveyorError,
) -> AuditEvent {
    error.log();
    let message = error.internal_message().unwrap_or(error.user_message());
    job.mark_failed(message, ErrorCode::InternalError, Utc::now());
    let event = AuditEvent::from_job(&job, AuditOutcome::Failed);
    state.registry.finish(job);
    event
}

fn next_step(shared: &Shared) -> Step {
    let mut state = shared.state.lock();
    if state.lifecycle != Lifecycle::Running {
        return Step::Stop;
    }

    if state.queue.is_empty() {
        return Step::Idle(state.retries.next_due());
    }
    let Some(permit) = shared.pool.try_acquire() else {
        return Step::Busy;
    };
    let Some(mut job) = state.queue.pop() else {
        return Step::Idle(state.retries.next_due());
    };

    job.mark_running(Utc::now());
    let running = RunningJob::new(job);
    let ctx = JobContext::new(
        running.metadata.clone(),
        running.token.clone(),
        running.progress.clone(),
    );
    let event = AuditEvent::from_job(&running.metadata, AuditOutcome::Started);
    state.registry.insert_running(running);

    Step::Dispatch(Dispatch { permit, ctx, event })
}

fn launch(shared: &Arc<Shared>, dispatch: Dispatch) {
    let Dispatch { permit, ctx, event } = dispatch;
    let job_id = ctx.job_id();

    JobMetrics::started(ctx.job_type());
    debug!(
        job_id = %job_id,
        job_type = %ctx.job_type(),
        priority = %ctx.metadata.priority,
        attempt = ctx.attempt(),
        "Dispatching job"
    );
    shared.emit(vec![event]);

    let handle = shared.pool.spawn(execute(shared.clone(), permit, ctx));
    if let Some(running) = shared.state.lock().registry.running_mut(&job_id) {
        running.abort = Some(handle.abort_handle());
    }
}

enum Attempt {
    NoHandler,
    Finished(JobResult),
}

async fn execute(shared: Arc<Shared>, permit: WorkerPermit, ctx: JobContext) {
    let job_id = ctx.job_id();
    let job_type = ctx.job_type().to_string();
    let attempt_number = ctx.attempt();
    let handler = shared.handlers.read().get(&job_type);

    let started = std::time::Instant::now();
    let attempt = match handler {
        None => Attempt::NoHandler,
        Some(handler) => {
            let span = info_span!("job", job_id = %job_id, job_type = %job_type, attempt = attempt_number);
            let result = AssertUnwindSafe(handler.handle(ctx))
                .catch_unwind()
                .instrument(span)
                .await
                .unwrap_or_else(|panic| {
                    Err(JobError::retryable(format!("handler panicked: {}", panic_message(&*panic)))
                        .with_code("panic"))
                });
            Attempt::Finished(result)
        }
    };

    let succeeded = finalize(&shared, job_id, attempt, started.elapsed());
    if succeeded {
        permit.mark_success();
    } else {
        permit.mark_failure();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Record the outcome of one attempt. Returns true if the job completed.
fn finalize(shared: &Shared, job_id: JobId, attempt: Attempt, elapsed: Duration) -> bool {
    let now = Utc::now();
    let mut state = shared.state.lock();

    let Some(running) = state.registry.take_running(&job_id) else {
        // Force-cancelled by the monitor or abandoned by shutdown
        drop(state);
        debug!(job_id = %job_id, "Executor finished after its job was finalized");
        return false;
    };
    let cancel_kind = running.cancel_requested.map(|(_, kind)| kind);
    let mut job = running.snapshot();
    let mut retry_delay = None;

    let mut kind = match attempt {
        Attempt::NoHandler => {
            let error = ConveyorError::handler_not_found(&job.job_type);
            job.mark_failed(error.user_message(), ErrorCode::HandlerNotFound, now);
            ErrorCode::HandlerNotFound
        }
        Attempt::Finished(Ok(value)) => {
            job.mark_completed(value, now);
            ErrorCode::InternalError
        }
        Attempt::Finished(Err(error)) => match cancel_kind {
            Some(kind) => {
                job.mark_cancelled(&format!("cancelled: {}", error), kind, now);
                kind
            }
            None if error.retryable && job.can_retry() && state.lifecycle == Lifecycle::Running => {
                let delay = shared.config.backoff.delay_for(job.retry_count + 1);
                let retry_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .unwrap_or(now);
                job.mark_retrying(&error.to_string(), ErrorCode::TransientExecution, retry_at);
                retry_delay = Some(delay);
                ErrorCode::TransientExecution
            }
            None => {
                job.mark_failed(&error.to_string(), error.error_code(), now);
                error.error_code()
            }
        },
    };

    let job_type = job.job_type.clone();
    let event = match retry_delay {
        Some(delay) => {
            let event = AuditEvent::from_job(&job, AuditOutcome::Retrying);
            match state.retries.schedule(job, Instant::now() + delay) {
                Ok(()) => event,
                Err(job) => {
                    let error = ConveyorError::internal(format!(
                        "job {} already had a retry outstanding",
                        job_id
                    ));
                    kind = ErrorCode::InternalError;
                    retry_delay = None;
                    fail_internal(&mut state, job, &error)
                }
            }
        }
        None => {
            let outcome = match job.status {
                JobStatus::Completed => AuditOutcome::Completed,
                JobStatus::Cancelled => AuditOutcome::Cancelled,
                _ => AuditOutcome::Failed,
            };
            let event = AuditEvent::from_job(&job, outcome);
            state.registry.finish(job);
            event
        }
    };
    let outcome = event.outcome;
    drop(state);

    JobMetrics::attempt_finished(&job_type, outcome.as_str(), elapsed.as_secs_f64());
    match outcome {
        AuditOutcome::Completed => {
            JobMetrics::completed(&job_type);
            info!(job_id = %job_id, job_type = %job_type, elapsed = ?elapsed, "Job completed");
        }
        AuditOutcome::Retrying => {
            JobMetrics::retried(&job_type);
            warn!(
                job_id = %job_id,
                job_type = %job_type,
                retry_count = event.attempt,
                delay = ?retry_delay,
                error = event.error_message.as_deref(),
                "Job failed, retry scheduled"
            );
        }
        AuditOutcome::Cancelled => {
            JobMetrics::cancelled(&job_type, kind.as_str());
            info!(job_id = %job_id, job_type = %job_type, reason = kind.as_str(), "Job cancelled");
        }
        _ => {
            if kind == ErrorCode::HandlerNotFound {
                ConveyorError::handler_not_found(&job_type).log();
            }
            JobMetrics::failed(&job_type, kind.as_str());
            warn!(
                job_id = %job_id,
                job_type = %job_type,
                attempts = event.attempt,
                error_kind = kind.as_str(),
                error = event.error_message.as_deref(),
                "Job failed"
            );
        }
    }

    let completed = outcome == AuditOutcome::Completed;
    shared.emit(vec![event]);
    completed
}
