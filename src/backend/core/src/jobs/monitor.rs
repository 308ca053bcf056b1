//! Periodic maintenance: stuck-job detection, cancel grace enforcement,
//! retention sweep and statistics refresh.

use chrono::Utc;
use std::sync::Arc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::audit::{AuditEvent, AuditOutcome};
use super::manager::{Lifecycle, ManagerState, Shared};
use super::JobId;
use crate::error::{ConveyorError, ErrorCode};
use crate::telemetry::JobMetrics;

/// What one monitor cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// RUNNING jobs newly signalled for exceeding the stuck timeout
    pub stuck_flagged: Vec<JobId>,
    /// Jobs marked CANCELLED after ignoring their cancel signal for the grace period
    pub force_cancelled: Vec<JobId>,
    /// Terminal records removed by the retention sweep
    pub evicted: usize,
}

pub(crate) async fn run(shared: Arc<Shared>) {
    let mut ticker = interval(shared.config.monitor_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    info!(interval = ?shared.config.monitor_interval, "Monitor started");

    loop {
        // Grace deadlines are enforced on their own timer, not on the next tick
        let grace_deadline = next_grace_deadline(&shared);

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let report = run_cycle(&shared);
                let busy = !report.stuck_flagged.is_empty()
                    || !report.force_cancelled.is_empty()
                    || report.evicted > 0;
                if busy {
                    debug!(
                        stuck = report.stuck_flagged.len(),
                        force_cancelled = report.force_cancelled.len(),
                        evicted = report.evicted,
                        "Monitor cycle"
                    );
                }
            }
            _ = shared.cancel_signalled.notified() => {}
            _ = sleep_until(grace_deadline.unwrap_or_else(Instant::now)), if grace_deadline.is_some() => {
                let forced = enforce_grace(&shared);
                if !forced.is_empty() {
                    debug!(force_cancelled = forced.len(), "Grace period expired");
                }
            }
        }
    }

    info!("Monitor stopped");
}

pub(crate) fn run_cycle(shared: &Shared) -> MonitorReport {
    let mut report = MonitorReport::default();
    let mut events = Vec::new();
    let now = Utc::now();
    let tick = Instant::now();
    let stuck_timeout = shared.config.stuck_timeout;

    {
        let mut state = shared.state.lock();

        for running in state.registry.running_jobs_mut() {
            if running.cancel_requested.is_some() {
                continue;
            }
            let Some(started_at) = running.metadata.started_at else {
                continue;
            };
            let Ok(elapsed) = (now - started_at).to_std() else {
                continue;
            };
            if elapsed > stuck_timeout {
                ConveyorError::stuck_job(
                    running.metadata.job_id,
                    (now - started_at).num_seconds(),
                    stuck_timeout.as_secs(),
                )
                .log();
                running.request_cancel(ErrorCode::StuckJob, tick);
                report.stuck_flagged.push(running.metadata.job_id);
            }
        }

        report.force_cancelled = force_overdue(shared, &mut state, tick, &mut events);

        let swept = state.registry.sweep(
            now,
            shared.config.completed_retention,
            shared.config.failed_retention,
        );
        report.evicted = swept.total();
        if swept.total() > 0 {
            JobMetrics::evicted(swept.total());
            debug!(
                completed = swept.completed,
                failed = swept.failed,
                "Evicted expired job records"
            );
        }
    }

    shared.emit(events);
    shared.refresh_statistics();
    report
}

/// Force-cancel every signalled job whose grace period has run out.
fn enforce_grace(shared: &Shared) -> Vec<JobId> {
    let mut events = Vec::new();
    let forced = {
        let mut state = shared.state.lock();
        force_overdue(shared, &mut state, Instant::now(), &mut events)
    };

    if !forced.is_empty() {
        shared.emit(events);
        shared.refresh_statistics();
    }
    forced
}

/// Earliest instant at which a signalled job runs out of grace.
fn next_grace_deadline(shared: &Shared) -> Option<Instant> {
    let state = shared.state.lock();
    if state.lifecycle != Lifecycle::Running {
        return None;
    }
    let grace = shared.config.cancel_grace_period;
    state
        .registry
        .running_jobs()
        .filter_map(|running| running.cancel_requested.map(|(at, _)| at + grace))
        .min()
}

fn force_overdue(
    shared: &Shared,
    state: &mut ManagerState,
    tick: Instant,
    events: &mut Vec<AuditEvent>,
) -> Vec<JobId> {
    // Shutdown abandons its own stragglers after the join timeout
    if state.lifecycle != Lifecycle::Running {
        return Vec::new();
    }

    let grace = shared.config.cancel_grace_period;
    let overdue: Vec<JobId> = state
        .registry
        .running_jobs()
        .filter(|running| {
            running
                .cancel_requested
                .is_some_and(|(at, _)| tick.saturating_duration_since(at) >= grace)
        })
        .map(|running| running.metadata.job_id)
        .collect();

    let now = Utc::now();
    let mut forced = Vec::with_capacity(overdue.len());
    for id in overdue {
        let Some(running) = state.registry.take_running(&id) else {
            continue;
        };
        let kind = running
            .cancel_requested
            .map(|(_, kind)| kind)
            .unwrap_or(ErrorCode::JobCancelled);
        running.abort();

        let mut job = running.snapshot();
        job.mark_cancelled("cancel signal not acknowledged within grace period", kind, now);
        warn!(
            job_id = %id,
            job_type = %job.job_type,
            reason = kind.as_str(),
            grace = ?grace,
            "Force-cancelled job"
        );
        JobMetrics::cancelled(&job.job_type, kind.as_str());
        events.push(AuditEvent::from_job(&job, AuditOutcome::Cancelled));
        state.registry.finish(job);
        forced.push(id);
    }
    forced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobManagerConfig;
    use crate::jobs::registry::RunningJob;
    use crate::jobs::{JobManager, JobMetadata, JobPriority, JobStatus};
    use std::time::Duration;

    fn signalled(shared: &Shared, at: Instant) -> JobId {
        let mut job = JobMetadata::new("report", JobPriority::Normal, 0);
        job.mark_running(Utc::now());
        let id = job.job_id;
        let mut running = RunningJob::new(job);
        running.request_cancel(ErrorCode::JobCancelled, at);
        shared.state.lock().registry.insert_running(running);
        id
    }

    #[test]
    fn test_grace_deadline_tracks_earliest_signal() {
        let config = JobManagerConfig {
            cancel_grace_period: Duration::from_millis(100),
            ..Default::default()
        };
        let manager = JobManager::new(config).unwrap();
        let shared = manager.shared();
        shared.state.lock().lifecycle = Lifecycle::Running;

        let t0 = Instant::now();
        let first = signalled(shared, t0);
        let second = signalled(shared, t0 + Duration::from_millis(50));
        assert_eq!(next_grace_deadline(shared), Some(t0 + Duration::from_millis(100)));

        let mut events = Vec::new();
        {
            let mut state = shared.state.lock();
            let early = force_overdue(shared, &mut state, t0 + Duration::from_millis(99), &mut events);
            assert!(early.is_empty());
            let due = force_overdue(shared, &mut state, t0 + Duration::from_millis(100), &mut events);
            assert_eq!(due, vec![first]);

            let job = state.registry.get(&first).unwrap();
            assert_eq!(job.status, JobStatus::Cancelled);
            assert_eq!(job.error_kind.as_deref(), Some("cancelled"));
        }
        assert_eq!(events.len(), 1);
        assert_eq!(next_grace_deadline(shared), Some(t0 + Duration::from_millis(150)));

        shared.state.lock().lifecycle = Lifecycle::Stopping;
        assert_eq!(next_grace_deadline(shared), None);
        assert_eq!(shared.state.lock().registry.get(&second).unwrap().status, JobStatus::Running);
    }
}
