//! End-to-end tests for the job manager.
//!
//! Tests cover:
//! - Retry exhaustion and priority boosting
//! - Worker pool bounds under load
//! - Cancellation before dispatch and while running
//! - Graceful and timed-out shutdown
//! - Missing handlers and panicking handlers
//! - Stuck-job detection and the retention sweep
//! - Queries, statistics and audit events

use conveyor_core::config::JobManagerConfig;
use conveyor_core::error::ErrorCode;
use conveyor_core::jobs::{
    handler_fn, register_builtin_handlers, AuditEvent, AuditOutcome, AuditSink, BackoffStrategy,
    DelayJob, JobError, JobFilter, JobId, JobManager, JobMetadata, JobPriority, JobRequest,
    JobStatus,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Utilities
// ============================================================================

fn fast_config() -> JobManagerConfig {
    JobManagerConfig {
        max_workers: 5,
        backoff: BackoffStrategy::fixed(Duration::from_millis(10)),
        poll_interval: Duration::from_millis(10),
        dispatch_backoff: Duration::from_millis(5),
        monitor_interval: Duration::from_millis(50),
        cancel_grace_period: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn wait_for_status(manager: &JobManager, id: JobId, status: JobStatus) -> JobMetadata {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = manager.get_job_status(id).expect("job should be known");
        if job.status == status {
            return job;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("job {} stuck in {} waiting for {}", id, job.status, status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until_idle(manager: &JobManager) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while manager.get_statistics().in_flight() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "manager never drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<Vec<AuditEvent>>>);

impl AuditSink for RecordingSink {
    fn record(&self, event: AuditEvent) {
        self.0.lock().push(event);
    }
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_job_exhausts_retries() {
    let manager = JobManager::new(fast_config()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    manager.register_handler(
        "always_fails",
        handler_fn(move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(JobError::retryable("upstream unavailable"))
            }
        }),
    );
    manager.start().unwrap();

    let id = manager
        .submit(JobRequest::new("always_fails").with_max_retries(2))
        .unwrap();
    let job = wait_for_status(&manager, id, JobStatus::Failed).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.error_message.as_deref(), Some("upstream unavailable"));
    assert_eq!(job.error_kind.as_deref(), Some("transient_execution"));
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_permanent_error_is_not_retried() {
    let manager = JobManager::new(fast_config()).unwrap();
    register_builtin_handlers(&manager);
    manager.start().unwrap();

    let id = manager
        .submit(JobRequest::new("fail").with_field("permanent", true).with_max_retries(5))
        .unwrap();
    let job = wait_for_status(&manager, id, JobStatus::Failed).await;

    assert_eq!(job.retry_count, 0);
    assert_eq!(job.error_kind.as_deref(), Some("permanent_execution"));
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_boosts_priority() {
    let manager = JobManager::new(fast_config()).unwrap();
    manager.register_handler(
        "flaky",
        handler_fn(|ctx| async move {
            if ctx.attempt() < 3 {
                Err(JobError::retryable("try again"))
            } else {
                Ok(serde_json::json!({ "priority": ctx.metadata.priority }))
            }
        }),
    );
    manager.start().unwrap();

    let id = manager
        .submit(JobRequest::new("flaky").with_priority(JobPriority::Low).with_max_retries(3))
        .unwrap();
    let job = wait_for_status(&manager, id, JobStatus::Completed).await;

    assert_eq!(job.retry_count, 2);
    assert_eq!(job.priority, JobPriority::High);
    assert_eq!(job.result.unwrap()["priority"], "high");
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_handler_is_retried() {
    let manager = JobManager::new(fast_config()).unwrap();
    manager.register_handler(
        "panics_once",
        handler_fn(|ctx| async move {
            if ctx.attempt() == 1 {
                panic!("first attempt explodes");
            }
            Ok(serde_json::Value::Null)
        }),
    );
    manager.register_handler(
        "always_panics",
        handler_fn(|_ctx| async move {
            if true {
                panic!("never works");
            }
            Ok(serde_json::Value::Null)
        }),
    );
    manager.start().unwrap();

    let recovered = manager
        .submit(JobRequest::new("panics_once").with_max_retries(1))
        .unwrap();
    let doomed = manager
        .submit(JobRequest::new("always_panics").with_max_retries(0))
        .unwrap();

    let job = wait_for_status(&manager, recovered, JobStatus::Completed).await;
    assert_eq!(job.retry_count, 1);

    let job = wait_for_status(&manager, doomed, JobStatus::Failed).await;
    assert!(job.error_message.unwrap().contains("never works"));

    // Manager keeps dispatching after panics
    let id = manager.submit(JobRequest::new("panics_once").with_max_retries(1)).unwrap();
    wait_for_status(&manager, id, JobStatus::Completed).await;
    manager.stop().await;
}

// ============================================================================
// Concurrency and Ordering
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_bound_holds_under_load() {
    let manager = JobManager::new(fast_config()).unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (active_h, peak_h) = (active.clone(), peak.clone());
    manager.register_handler(
        "sleepy",
        handler_fn(move |_ctx| {
            let active = active_h.clone();
            let peak = peak_h.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            }
        }),
    );
    manager.start().unwrap();

    let ids: Vec<JobId> = (0..100)
        .map(|_| manager.submit(JobRequest::new("sleepy")).unwrap())
        .collect();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let stats = manager.get_statistics();
        assert!(stats.running <= 5, "{} jobs running", stats.running);
        if stats.completed == 100 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "load never completed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(peak.load(Ordering::SeqCst) <= 5);
    for id in ids {
        assert_eq!(manager.get_job_status(id).unwrap().status, JobStatus::Completed);
    }
    let pool = manager.pool_stats();
    assert!(pool.peak_concurrent <= 5);
    assert_eq!(pool.tasks_succeeded, 100);
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dispatch_order_follows_priority_then_fifo() {
    let config = JobManagerConfig {
        max_workers: 1,
        ..fast_config()
    };
    let manager = JobManager::new(config).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    manager.register_handler(
        "label",
        handler_fn(move |ctx| {
            let seen = seen.clone();
            async move {
                let label = ctx.payload().get("label").cloned().unwrap_or_default();
                seen.lock().push(label.as_str().unwrap_or_default().to_string());
                Ok(serde_json::Value::Null)
            }
        }),
    );

    // Queued before start so dispatch sees the whole set
    for (label, priority) in [
        ("low", JobPriority::Low),
        ("normal-a", JobPriority::Normal),
        ("high", JobPriority::High),
        ("critical", JobPriority::Critical),
        ("normal-b", JobPriority::Normal),
    ] {
        manager
            .submit(JobRequest::new("label").with_priority(priority).with_field("label", label))
            .unwrap();
    }
    manager.start().unwrap();
    wait_until_idle(&manager).await;

    assert_eq!(
        *order.lock(),
        vec!["critical", "high", "normal-a", "normal-b", "low"]
    );
    manager.stop().await;
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_before_dispatch_never_runs_handler() {
    let manager = JobManager::new(fast_config()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    manager.register_handler(
        "counted",
        handler_fn(move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            }
        }),
    );

    let id = manager.submit(JobRequest::new("counted")).unwrap();
    assert!(manager.cancel(id));
    assert_eq!(manager.get_job_status(id).unwrap().status, JobStatus::Cancelled);

    manager.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let job = manager.get_job_status(id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error_kind.as_deref(), Some("cancelled"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!manager.cancel(id));
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_running_cooperative_job() {
    let manager = JobManager::new(fast_config()).unwrap();
    register_builtin_handlers(&manager);
    manager.start().unwrap();

    let id = manager
        .submit(JobRequest::new(DelayJob::JOB_TYPE).with_field("duration_ms", 10_000))
        .unwrap();
    wait_for_status(&manager, id, JobStatus::Running).await;

    assert!(manager.cancel(id));
    let job = wait_for_status(&manager, id, JobStatus::Cancelled).await;
    assert_eq!(job.error_kind.as_deref(), Some("cancelled"));
    assert_eq!(job.retry_count, 0);
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_running_uncooperative_job_is_forced() {
    let config = JobManagerConfig {
        monitor_interval: Duration::from_secs(3600),
        cancel_grace_period: Duration::from_millis(100),
        ..fast_config()
    };
    let manager = JobManager::new(config).unwrap();
    manager.register_handler(
        "stubborn",
        handler_fn(|_ctx| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(serde_json::Value::Null)
        }),
    );
    manager.start().unwrap();

    let id = manager.submit(JobRequest::new("stubborn")).unwrap();
    wait_for_status(&manager, id, JobStatus::Running).await;
    let signalled = tokio::time::Instant::now();
    assert!(manager.cancel(id));

    // Inside the grace period the job is still running
    let report = manager.run_monitor_cycle();
    assert!(report.force_cancelled.is_empty());
    assert!(manager.get_job_status(id).unwrap().cancel_requested);

    // Forced once the grace period runs out, without waiting for a monitor tick
    let job = wait_for_status(&manager, id, JobStatus::Cancelled).await;
    assert!(signalled.elapsed() >= Duration::from_millis(100));
    assert!(signalled.elapsed() < Duration::from_secs(2));
    assert_eq!(job.error_kind.as_deref(), Some("cancelled"));
    assert_eq!(manager.get_statistics().running, 0);
    manager.stop().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_cancels_cooperative_running_job() {
    let manager = JobManager::new(fast_config()).unwrap();
    register_builtin_handlers(&manager);
    manager.start().unwrap();

    let id = manager
        .submit(JobRequest::new(DelayJob::JOB_TYPE).with_field("duration_ms", 10_000))
        .unwrap();
    wait_for_status(&manager, id, JobStatus::Running).await;

    let report = manager.stop().await;
    assert!(!report.timed_out);
    assert_eq!(report.signalled_running, 1);
    assert!(report.abandoned.is_empty());
    assert!(!manager.is_running());

    let job = manager.get_job_status(id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error_kind.as_deref(), Some("shutdown"));
    assert_eq!(manager.pool_stats().active_workers, 0);

    let error = manager.submit(JobRequest::new("echo")).unwrap_err();
    assert_eq!(error.code(), ErrorCode::ShuttingDown);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_abandons_job_past_timeout() {
    let config = JobManagerConfig {
        shutdown_timeout: Duration::from_millis(200),
        ..fast_config()
    };
    let manager = JobManager::new(config).unwrap();
    manager.register_handler(
        "stubborn",
        handler_fn(|_ctx| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(serde_json::Value::Null)
        }),
    );
    manager.start().unwrap();

    let id = manager.submit(JobRequest::new("stubborn")).unwrap();
    wait_for_status(&manager, id, JobStatus::Running).await;

    let started = tokio::time::Instant::now();
    let report = manager.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(report.timed_out);
    assert_eq!(report.abandoned, vec![id]);

    let job = manager.get_job_status(id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error_kind.as_deref(), Some("shutdown"));

    // Second stop is a no-op
    assert!(manager.stop().await.already_stopped);
}

// ============================================================================
// Missing Handlers and Stuck Jobs
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_job_type_fails_without_retry() {
    let manager = JobManager::new(fast_config()).unwrap();
    manager.start().unwrap();

    let id = manager
        .submit(JobRequest::new("unknown").with_max_retries(3))
        .unwrap();
    let job = wait_for_status(&manager, id, JobStatus::Failed).await;

    assert_eq!(job.retry_count, 0);
    assert_eq!(job.error_kind.as_deref(), Some("handler_not_found"));
    assert!(job.error_message.unwrap().contains("unknown"));
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stuck_job_is_cancelled_by_monitor() {
    let config = JobManagerConfig {
        monitor_interval: Duration::from_millis(500),
        stuck_timeout: Duration::from_millis(50),
        cancel_grace_period: Duration::from_millis(100),
        ..fast_config()
    };
    let manager = JobManager::new(config).unwrap();
    manager.register_handler(
        "blocks",
        handler_fn(|_ctx| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(serde_json::Value::Null)
        }),
    );
    manager.start().unwrap();
    let started = tokio::time::Instant::now();

    let id = manager.submit(JobRequest::new("blocks")).unwrap();
    wait_for_status(&manager, id, JobStatus::Running).await;

    // Flagged on the first tick at 500ms, forced 100ms later; the next tick is at 1s
    tokio::time::sleep_until(started + Duration::from_millis(850)).await;
    let job = manager.get_job_status(id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error_kind.as_deref(), Some("stuck_job"));
    assert_eq!(job.retry_count, 0);
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cooperative_stuck_job_records_stuck_kind() {
    let config = JobManagerConfig {
        stuck_timeout: Duration::from_millis(100),
        cancel_grace_period: Duration::from_secs(10),
        ..fast_config()
    };
    let manager = JobManager::new(config).unwrap();
    register_builtin_handlers(&manager);
    manager.start().unwrap();

    let id = manager
        .submit(JobRequest::new(DelayJob::JOB_TYPE).with_field("duration_ms", 10_000))
        .unwrap();
    let job = wait_for_status(&manager, id, JobStatus::Cancelled).await;
    assert_eq!(job.error_kind.as_deref(), Some("stuck_job"));
    manager.stop().await;
}

// ============================================================================
// Retention, Queries and Statistics
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retention_sweep_evicts_finished_jobs() {
    let config = JobManagerConfig {
        monitor_interval: Duration::from_secs(3600),
        completed_retention: Duration::ZERO,
        ..fast_config()
    };
    let manager = JobManager::new(config).unwrap();
    register_builtin_handlers(&manager);
    manager.register_handler(
        "parked",
        handler_fn(|ctx| async move {
            ctx.cancelled().await;
            Err(JobError::permanent("stopped"))
        }),
    );
    manager.start().unwrap();

    let done = manager.submit(JobRequest::new("echo")).unwrap();
    let running = manager.submit(JobRequest::new("parked")).unwrap();
    wait_for_status(&manager, done, JobStatus::Completed).await;
    wait_for_status(&manager, running, JobStatus::Running).await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = manager.run_monitor_cycle();
    assert_eq!(report.evicted, 1);

    let error = manager.get_job_status(done).unwrap_err();
    assert_eq!(error.code(), ErrorCode::JobNotFound);
    assert_eq!(manager.get_job_status(running).unwrap().status, JobStatus::Running);
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_find_jobs_and_recent() {
    let manager = JobManager::new(fast_config()).unwrap();
    register_builtin_handlers(&manager);

    let first = manager
        .submit(JobRequest::new("echo").with_owner("alice").with_resource("report", "r-1"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = manager
        .submit(JobRequest::new("echo").with_owner("alice").with_resource("report", "r-2"))
        .unwrap();
    manager.submit(JobRequest::new("echo").with_owner("bob")).unwrap();

    // Pending jobs are searchable but not part of the recent list
    assert_eq!(manager.find_jobs(&JobFilter::new().owner("alice")).len(), 2);
    assert!(manager.get_recent(10).is_empty());

    manager.start().unwrap();
    wait_until_idle(&manager).await;

    let alice = manager.find_jobs(&JobFilter::new().owner("alice"));
    assert_eq!(
        alice.iter().map(|job| job.job_id).collect::<Vec<_>>(),
        vec![second, first]
    );
    let by_resource = manager.find_jobs(&JobFilter::new().resource("report", "r-1"));
    assert_eq!(by_resource.len(), 1);
    assert_eq!(by_resource[0].job_id, first);

    let completed = manager.find_jobs(&JobFilter::new().status(JobStatus::Completed));
    assert_eq!(completed.len(), 3);
    assert_eq!(manager.get_recent(2).len(), 2);
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_statistics_and_audit_trail() {
    let sink = RecordingSink::default();
    let manager = JobManager::with_audit_sink(fast_config(), Arc::new(sink.clone())).unwrap();
    register_builtin_handlers(&manager);
    manager.start().unwrap();

    let ok = manager.submit(JobRequest::new("echo")).unwrap();
    let bad = manager
        .submit(JobRequest::new("fail").with_max_retries(1))
        .unwrap();
    wait_for_status(&manager, ok, JobStatus::Completed).await;
    wait_for_status(&manager, bad, JobStatus::Failed).await;

    let stats = manager.get_statistics();
    assert_eq!(stats.total_submitted, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.in_flight(), 0);
    assert_eq!(stats.max_workers, 5);

    let events = sink.0.lock();
    let outcomes = |id: JobId| -> Vec<AuditOutcome> {
        events
            .iter()
            .filter(|event| event.job_id == id)
            .map(|event| event.outcome)
            .collect()
    };
    assert_eq!(outcomes(ok), vec![AuditOutcome::Started, AuditOutcome::Completed]);
    assert_eq!(
        outcomes(bad),
        vec![
            AuditOutcome::Started,
            AuditOutcome::Retrying,
            AuditOutcome::Started,
            AuditOutcome::Failed,
        ]
    );
    drop(events);
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_statistics_count_cancellations_and_processing_time() {
    let manager = JobManager::new(fast_config()).unwrap();
    register_builtin_handlers(&manager);

    let cancelled = manager.submit(JobRequest::new("echo")).unwrap();
    assert!(manager.cancel(cancelled));
    let timed = manager
        .submit(
            JobRequest::new(DelayJob::JOB_TYPE)
                .with_field("duration_ms", 100)
                .with_field("steps", 2),
        )
        .unwrap();
    manager.start().unwrap();
    wait_for_status(&manager, timed, JobStatus::Completed).await;

    let stats = manager.get_statistics();
    assert_eq!(stats.total_submitted, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.failed, 0);
    assert!(stats.avg_processing_time >= Duration::from_millis(100));
    assert!(stats.avg_processing_time < Duration::from_secs(5));
    manager.stop().await;
}
