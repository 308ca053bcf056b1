//! Prometheus metrics for the job manager.
//!
//! Metric emission goes through the `metrics` facade, so it is a no-op until a
//! recorder is installed with [`init_metrics`].
//!
//! # Example
//!
//! ```rust,no_run
//! use conveyor_core::telemetry::metrics::JobMetrics;
//!
//! JobMetrics::submitted("email", "normal");
//! JobMetrics::set_queue_depth(12);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Serve `/metrics` on this address (e.g. "0.0.0.0:9090"); unset keeps metrics in-process
    #[serde(default)]
    pub listen_address: Option<String>,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen_address: None,
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

// Default value functions
fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![
        0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 1800.0, 7200.0,
    ]
}

/// Handle to the installed recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder behind it.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// With a `listen_address` the exporter also serves scrapes over HTTP, which
/// requires a running tokio runtime.
///
/// # Errors
///
/// Returns an error if the address is invalid or a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new().add_global_label("service", service_name);

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = match &config.listen_address {
        Some(address) => {
            let address: SocketAddr = address.parse()?;
            let (recorder, exporter) = builder.with_http_listener(address).build()?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|_| anyhow::anyhow!("a metrics recorder is already installed"))?;
            tokio::spawn(async move {
                if let Err(error) = exporter.await {
                    tracing::error!(error = ?error, "Prometheus exporter stopped");
                }
            });
            handle
        }
        None => builder.install_recorder()?,
    };

    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        listen_address = ?config.listen_address,
        "Metrics initialized"
    );

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

/// Register all metric descriptions.
fn register_metric_descriptions() {
    describe_counter!("conveyor_jobs_submitted_total", "Jobs accepted by submit");
    describe_counter!("conveyor_jobs_rejected_total", "Submissions rejected because the queue was full");
    describe_counter!("conveyor_jobs_started_total", "Execution attempts started");
    describe_counter!("conveyor_jobs_completed_total", "Jobs that completed successfully");
    describe_counter!("conveyor_jobs_failed_total", "Jobs that failed permanently");
    describe_counter!("conveyor_jobs_retried_total", "Failed attempts scheduled for retry");
    describe_counter!("conveyor_jobs_cancelled_total", "Jobs cancelled, by reason");
    describe_counter!("conveyor_jobs_evicted_total", "Terminal jobs removed by the retention sweep");
    describe_counter!("conveyor_errors_total", "Errors raised by the job manager");
    describe_counter!("conveyor_audit_dropped_total", "Audit events dropped by a full sink");

    describe_histogram!("conveyor_job_duration_seconds", "Handler execution time in seconds");

    describe_gauge!("conveyor_queue_depth", "Jobs waiting in the priority queue");
    describe_gauge!("conveyor_jobs_running", "Jobs currently held by an executor");
    describe_gauge!("conveyor_jobs_retrying", "Jobs waiting out a retry backoff");
}

/// Job lifecycle metrics.
pub struct JobMetrics;

impl JobMetrics {
    pub fn submitted(job_type: &str, priority: &'static str) {
        counter!(
            "conveyor_jobs_submitted_total",
            "job_type" => job_type.to_string(),
            "priority" => priority,
        )
        .increment(1);
    }

    pub fn rejected(job_type: &str) {
        counter!("conveyor_jobs_rejected_total", "job_type" => job_type.to_string()).increment(1);
    }

    pub fn started(job_type: &str) {
        counter!("conveyor_jobs_started_total", "job_type" => job_type.to_string()).increment(1);
    }

    /// Record how long one handler invocation took, whatever its outcome.
    pub fn attempt_finished(job_type: &str, outcome: &'static str, duration_seconds: f64) {
        histogram!(
            "conveyor_job_duration_seconds",
            "job_type" => job_type.to_string(),
            "outcome" => outcome,
        )
        .record(duration_seconds);
    }

    pub fn completed(job_type: &str) {
        counter!("conveyor_jobs_completed_total", "job_type" => job_type.to_string()).increment(1);
    }

    pub fn failed(job_type: &str, error_kind: &'static str) {
        counter!(
            "conveyor_jobs_failed_total",
            "job_type" => job_type.to_string(),
            "error_kind" => error_kind,
        )
        .increment(1);
    }

    pub fn retried(job_type: &str) {
        counter!("conveyor_jobs_retried_total", "job_type" => job_type.to_string()).increment(1);
    }

    pub fn cancelled(job_type: &str, reason: &'static str) {
        counter!(
            "conveyor_jobs_cancelled_total",
            "job_type" => job_type.to_string(),
            "reason" => reason,
        )
        .increment(1);
    }

    pub fn evicted(count: usize) {
        counter!("conveyor_jobs_evicted_total").increment(count as u64);
    }

    pub fn set_queue_depth(depth: usize) {
        gauge!("conveyor_queue_depth").set(depth as f64);
    }

    pub fn set_running(running: usize) {
        gauge!("conveyor_jobs_running").set(running as f64);
    }

    pub fn set_retrying(retrying: usize) {
        gauge!("conveyor_jobs_retrying").set(retrying as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_defaults() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert!(config.listen_address.is_none());
        assert!(config.duration_buckets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_disabled_registry_renders_nothing() {
        let config = MetricsConfig {
            enabled: false,
            ..Default::default()
        };
        let registry = init_metrics(&config, "conveyor").unwrap();
        assert!(!registry.is_enabled());
        assert!(registry.render().is_empty());
    }

    #[test]
    fn test_emission_without_recorder_is_noop() {
        JobMetrics::submitted("email", "high");
        JobMetrics::attempt_finished("email", "completed", 0.25);
        JobMetrics::set_queue_depth(3);
    }
}
