//! Configuration management.
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML file,
//! then `CONVEYOR__SECTION__KEY` environment variables. Durations are written
//! in humantime notation (`"250ms"`, `"30s"`, `"2h"`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ConveyorError, Result};
use crate::jobs::BackoffStrategy;
use crate::telemetry::TelemetryConfig;

const ENV_PREFIX: &str = "CONVEYOR";

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Job manager configuration
    #[serde(default)]
    pub jobs: JobManagerConfig,

    /// Logging and metrics configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Job manager tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobManagerConfig {
    /// Concurrent executors
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Pending jobs accepted before `submit` fails with QueueFull
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Retries allowed when a submission does not set its own
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Longest the dispatcher sleeps with nothing to do
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Dispatcher back-off while every worker is busy
    #[serde(default = "default_dispatch_backoff", with = "humantime_serde")]
    pub dispatch_backoff: Duration,

    #[serde(default = "default_monitor_interval", with = "humantime_serde")]
    pub monitor_interval: Duration,

    /// RUNNING for longer than this is considered stuck
    #[serde(default = "default_stuck_timeout", with = "humantime_serde")]
    pub stuck_timeout: Duration,

    /// Time a signalled job gets to wind down before it is force-cancelled
    #[serde(default = "default_cancel_grace_period", with = "humantime_serde")]
    pub cancel_grace_period: Duration,

    #[serde(default = "default_completed_retention", with = "humantime_serde")]
    pub completed_retention: Duration,

    /// Applies to FAILED and CANCELLED jobs
    #[serde(default = "default_failed_retention", with = "humantime_serde")]
    pub failed_retention: Duration,

    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Capacity of the audit event channel
    #[serde(default = "default_audit_buffer")]
    pub audit_buffer: usize,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_queue_size: default_max_queue_size(),
            default_max_retries: default_max_retries(),
            backoff: BackoffStrategy::default(),
            poll_interval: default_poll_interval(),
            dispatch_backoff: default_dispatch_backoff(),
            monitor_interval: default_monitor_interval(),
            stuck_timeout: default_stuck_timeout(),
            cancel_grace_period: default_cancel_grace_period(),
            completed_retention: default_completed_retention(),
            failed_retention: default_failed_retention(),
            shutdown_timeout: default_shutdown_timeout(),
            audit_buffer: default_audit_buffer(),
        }
    }
}

impl JobManagerConfig {
    /// Reject settings the manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(ConveyorError::invalid_config("jobs.max_workers", "must be at least 1"));
        }
        if self.max_queue_size == 0 {
            return Err(ConveyorError::invalid_config("jobs.max_queue_size", "must be at least 1"));
        }

        let intervals = [
            ("jobs.poll_interval", self.poll_interval),
            ("jobs.dispatch_backoff", self.dispatch_backoff),
            ("jobs.monitor_interval", self.monitor_interval),
            ("jobs.stuck_timeout", self.stuck_timeout),
        ];
        for (field, value) in intervals {
            if value.is_zero() {
                return Err(ConveyorError::invalid_config(field, "must be greater than zero"));
            }
        }

        match &self.backoff {
            BackoffStrategy::Fixed { .. } => {}
            BackoffStrategy::Linear { initial, max, .. } => {
                if max < initial {
                    return Err(ConveyorError::invalid_config(
                        "jobs.backoff.max",
                        "must not be below the initial delay",
                    ));
                }
            }
            BackoffStrategy::Exponential {
                initial,
                multiplier,
                max,
            } => {
                if max < initial {
                    return Err(ConveyorError::invalid_config(
                        "jobs.backoff.max",
                        "must not be below the initial delay",
                    ));
                }
                if !multiplier.is_finite() || *multiplier < 1.0 {
                    return Err(ConveyorError::invalid_config(
                        "jobs.backoff.multiplier",
                        "must be a finite number of at least 1.0",
                    ));
                }
            }
        }

        Ok(())
    }
}

// Default value functions
fn default_max_workers() -> usize { 5 }
fn default_max_queue_size() -> usize { 10_000 }
fn default_max_retries() -> u32 { 3 }
fn default_poll_interval() -> Duration { Duration::from_secs(1) }
fn default_dispatch_backoff() -> Duration { Duration::from_millis(100) }
fn default_monitor_interval() -> Duration { Duration::from_secs(30) }
fn default_stuck_timeout() -> Duration { Duration::from_secs(2 * 3600) }
fn default_cancel_grace_period() -> Duration { Duration::from_secs(10) }
fn default_completed_retention() -> Duration { Duration::from_secs(24 * 3600) }
fn default_failed_retention() -> Duration { Duration::from_secs(7 * 24 * 3600) }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(30) }
fn default_audit_buffer() -> usize { 1024 }

impl Config {
    /// Load configuration from the environment only.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(environment())
            .build()?;

        Self::finish(config)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(environment())
            .build()?;

        Self::finish(config)
    }

    fn finish(config: config::Config) -> Result<Self> {
        let cfg: Config = config.try_deserialize()?;
        cfg.jobs.validate()?;
        Ok(cfg)
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
