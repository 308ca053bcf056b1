//! Conveyor - Main entry point
//!
//! Runs the job manager with the built-in handlers until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

use conveyor_core::{
    config::Config,
    jobs::{
        register_builtin_handlers, ChannelAuditSink, DelayJob, EchoJob, FailJob, JobManager,
        JobPriority, JobRequest, JobStatistics, ShutdownReport,
    },
    telemetry::init_telemetry,
};

#[derive(Parser)]
#[command(
    name = "conveyor",
    version,
    about = "Conveyor - in-process priority job manager",
    propagate_version = true
)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, env = "CONVEYOR_CONFIG")]
    config: Option<PathBuf>,

    /// Submit this many demo jobs after startup
    #[arg(long, default_value_t = 0)]
    demo: usize,

    /// Stop once every demo job has reached a terminal state
    #[arg(long, requires = "demo")]
    drain: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let path = path.to_str().context("Config path is not valid UTF-8")?;
            Config::from_file(path)?
        }
        None => Config::load()?,
    };

    if cli.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let _telemetry = init_telemetry(&config.telemetry)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Conveyor");

    let audit = Arc::new(ChannelAuditSink::tracing(config.jobs.audit_buffer));
    let manager = JobManager::with_audit_sink(config.jobs.clone(), audit)?;
    register_builtin_handlers(&manager);
    manager.start()?;

    if cli.demo > 0 {
        submit_demo_jobs(&manager, cli.demo)?;
    }

    let report = if cli.drain {
        let drained = wait_drained(manager.clone());
        manager
            .run_until(async {
                tokio::select! {
                    _ = shutdown_signal() => {},
                    _ = drained => tracing::info!("Demo jobs drained"),
                }
            })
            .await?
    } else {
        manager.run_until(shutdown_signal()).await?
    };

    print_summary(&manager.get_statistics(), &report);
    tracing::info!("Conveyor shutdown complete");

    Ok(())
}

/// Mix of echo, delay and failing jobs across every priority.
fn submit_demo_jobs(manager: &JobManager, count: usize) -> anyhow::Result<()> {
    const PRIORITIES: [JobPriority; 4] = [
        JobPriority::Low,
        JobPriority::Normal,
        JobPriority::High,
        JobPriority::Critical,
    ];

    for i in 0..count {
        let priority = PRIORITIES[i % PRIORITIES.len()];
        let request = match i % 5 {
            0 | 1 => JobRequest::new(EchoJob::JOB_TYPE).with_field("sequence", i as u64),
            2 | 3 => JobRequest::new(DelayJob::JOB_TYPE).with_field("duration_ms", 200 + (i as u64 % 7) * 100),
            _ => JobRequest::new(FailJob::JOB_TYPE)
                .with_field("message", format!("demo failure {}", i))
                .with_max_retries(2),
        };
        let job_id = manager.submit(request.with_priority(priority).with_owner("demo"))?;
        tracing::debug!(job_id = %job_id, priority = %priority, "Submitted demo job");
    }

    tracing::info!(count, "Demo jobs submitted");
    Ok(())
}

async fn wait_drained(manager: JobManager) {
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        ticker.tick().await;
        if manager.get_statistics().in_flight() == 0 {
            return;
        }
    }
}

#[derive(Tabled)]
struct SummaryRow {
    #[tabled(rename = "Metric")]
    metric: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

fn print_summary(stats: &JobStatistics, report: &ShutdownReport) {
    let rows = vec![
        SummaryRow { metric: "Submitted", value: stats.total_submitted.to_string() },
        SummaryRow { metric: "Completed", value: stats.completed.to_string() },
        SummaryRow { metric: "Failed", value: stats.failed.to_string() },
        SummaryRow { metric: "Cancelled", value: stats.cancelled.to_string() },
        SummaryRow {
            metric: "Avg processing time",
            value: format!("{:?}", stats.avg_processing_time),
        },
        SummaryRow { metric: "Cancelled at shutdown", value: report.cancelled_pending.to_string() },
        SummaryRow { metric: "Abandoned", value: report.abandoned.len().to_string() },
        SummaryRow { metric: "Shutdown timed out", value: report.timed_out.to_string() },
    ];

    let table = Table::new(rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::first()).with(Alignment::left()))
        .to_string();
    println!("{}", table);
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(error = %error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
