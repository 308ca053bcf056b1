//! Error handling for Conveyor.
//!
//! This module provides:
//! - Error codes covering the job manager failure taxonomy
//! - User-facing messages vs detailed internal messages
//! - Structured details (entity, retry hints, context)
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use conveyor_core::error::{ConveyorError, Result, ResultExt};
//!
//! fn load() -> Result<String> {
//!     std::fs::read_to_string("conveyor.toml").context("Failed to read config file")
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Conveyor operations.
pub type Result<T> = std::result::Result<T, ConveyorError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Submission Errors (1000-1099)
    QueueFull,
    ShuttingDown,
    AlreadyStarted,

    // Execution Errors (1100-1199)
    HandlerNotFound,
    TransientExecution,
    PermanentExecution,
    StuckJob,
    JobCancelled,

    // Lookup Errors (1200-1299)
    JobNotFound,

    // Serialization Errors (2200-2299)
    SerializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::QueueFull => 1000,
            Self::ShuttingDown => 1001,
            Self::AlreadyStarted => 1002,

            Self::HandlerNotFound => 1100,
            Self::TransientExecution => 1101,
            Self::PermanentExecution => 1102,
            Self::StuckJob => 1103,
            Self::JobCancelled => 1104,

            Self::JobNotFound => 1200,

            Self::SerializationError => 2200,

            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5001,

            Self::InternalError => 9000,
        }
    }

    /// Check if an operation failing with this code can be attempted again.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull | Self::TransientExecution)
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "submission",
            1100..=1199 => "execution",
            1200..=1299 => "lookup",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }

    /// Snake-case label, used as the `error_kind` recorded on job metadata.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::ShuttingDown => "shutdown",
            Self::AlreadyStarted => "already_started",
            Self::HandlerNotFound => "handler_not_found",
            Self::TransientExecution => "transient_execution",
            Self::PermanentExecution => "permanent_execution",
            Self::StuckJob => "stuck_job",
            Self::JobCancelled => "cancelled",
            Self::JobNotFound => "job_not_found",
            Self::SerializationError => "serialization_error",
            Self::ConfigurationError => "configuration_error",
            Self::InvalidConfiguration => "invalid_configuration",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (unknown ids, rejected submissions)
    Low,
    /// Operational issues (job failures, stuck jobs)
    Medium,
    /// System errors (bad configuration, internal inconsistencies)
    High,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobNotFound
            | ErrorCode::QueueFull
            | ErrorCode::ShuttingDown
            | ErrorCode::AlreadyStarted
            | ErrorCode::JobCancelled => Self::Low,

            ErrorCode::HandlerNotFound
            | ErrorCode::TransientExecution
            | ErrorCode::PermanentExecution
            | ErrorCode::StuckJob => Self::Medium,

            ErrorCode::SerializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration
            | ErrorCode::InternalError => Self::High,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured information attached to an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Arbitrary key/value context
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Type of the entity involved (e.g. "job")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Identifier of the entity involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Suggested wait before retrying the operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,

    /// Suggested corrective action
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Conveyor.
///
/// This error type supports:
/// - Structured error codes
/// - Error chaining with context
/// - User-facing vs internal messages
/// - Metrics integration
#[derive(Error, Debug)]
pub struct ConveyorError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Message safe to surface to callers
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ConveyorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl ConveyorError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Configuration error",
            message,
        )
    }

    /// Create an invalid configuration error for a specific field.
    pub fn invalid_config(field: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ErrorCode::InvalidConfiguration,
            format!("Invalid configuration for '{}': {}", field, reason),
        )
        .with_context("field", field)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "conveyor_errors_total",
            "code" => self.code.as_str(),
            "category" => self.code.category(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Context Extension
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for attaching context to fallible results.
pub trait ResultExt<T> {
    /// Wrap the error as an internal error with the given message.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap the error with a specific error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| ConveyorError::internal(message).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| {
            let message = e.to_string();
            ConveyorError::with_internal(code, "Operation failed", message).with_source(e)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for ConveyorError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to process JSON payload",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<config::ConfigError> for ConveyorError {
    fn from(error: config::ConfigError) -> Self {
        Self::configuration(error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for ConveyorError {
    fn from(error: std::io::Error) -> Self {
        Self::internal(format!("I/O error: {}", error)).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for ConveyorError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::internal(format!("Operation timed out: {}", error))
    }
}

impl From<anyhow::Error> for ConveyorError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", error))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Manager Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl ConveyorError {
    /// The pending queue is at capacity.
    pub fn queue_full(capacity: usize) -> Self {
        Self::new(
            ErrorCode::QueueFull,
            format!("Job queue is full (capacity {})", capacity),
        )
        .with_details(
            ErrorDetails::new()
                .with_context("capacity", capacity)
                .with_retry_after(1)
                .with_suggestion("Retry later or reduce submission rate"),
        )
    }

    /// The manager has been stopped and no longer accepts work.
    pub fn shutting_down() -> Self {
        Self::new(ErrorCode::ShuttingDown, "Job manager is shutting down")
    }

    /// `start()` was called on a manager that already started.
    pub fn already_started() -> Self {
        Self::new(ErrorCode::AlreadyStarted, "Job manager was already started")
    }

    /// No job with the given id is known.
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        let id = job_id.to_string();
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("job", id))
    }

    /// No handler is registered for a job type.
    pub fn handler_not_found(job_type: &str) -> Self {
        Self::new(
            ErrorCode::HandlerNotFound,
            format!("No handler registered for job type '{}'", job_type),
        )
        .with_context("job_type", job_type)
    }

    /// A running job exceeded the stuck timeout.
    pub fn stuck_job(job_id: impl fmt::Display, running_secs: i64, timeout_secs: u64) -> Self {
        Self::new(
            ErrorCode::StuckJob,
            format!(
                "Job {} exceeded stuck timeout: running {}s, limit {}s",
                job_id, running_secs, timeout_secs
            ),
        )
        .with_context("running_secs", running_secs)
        .with_context("timeout_secs", timeout_secs)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::QueueFull.is_retryable());
        assert!(ErrorCode::TransientExecution.is_retryable());
        assert!(!ErrorCode::PermanentExecution.is_retryable());
        assert!(!ErrorCode::HandlerNotFound.is_retryable());
        assert!(!ErrorCode::StuckJob.is_retryable());
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::QueueFull.category(), "submission");
        assert_eq!(ErrorCode::StuckJob.category(), "execution");
        assert_eq!(ErrorCode::JobNotFound.category(), "lookup");
        assert_eq!(ErrorCode::InvalidConfiguration.category(), "configuration");
        assert_eq!(ErrorCode::InternalError.category(), "internal");
    }

    #[test]
    fn test_queue_full_details() {
        let error = ConveyorError::queue_full(10);
        assert_eq!(error.code(), ErrorCode::QueueFull);
        assert!(error.is_retryable());
        assert_eq!(error.details().retry_after_secs, Some(1));
        assert!(error.user_message().contains("capacity 10"));
    }

    #[test]
    fn test_job_not_found_entity() {
        let error = ConveyorError::job_not_found("abc-123");
        assert_eq!(error.details().entity_type.as_deref(), Some("job"));
        assert_eq!(error.details().entity_id.as_deref(), Some("abc-123"));
        assert_eq!(error.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_error_context() {
        let error = ConveyorError::invalid_config("max_workers", "must be greater than zero")
            .with_context("value", 0);

        assert!(error.details().context.contains_key("field"));
        assert!(error.details().context.contains_key("value"));
        assert_eq!(error.severity(), ErrorSeverity::High);
    }

    #[test]
    fn test_result_ext() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"));
        let error = result.context("Failed to open").unwrap_err();
        assert_eq!(error.code(), ErrorCode::InternalError);
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn test_error_display() {
        let error = ConveyorError::with_internal(
            ErrorCode::InternalError,
            "Registry inconsistency",
            "job missing from running partition",
        );

        let display = format!("{}", error);
        assert!(display.contains("InternalError"));
        assert!(display.contains("Registry inconsistency"));
        assert!(display.contains("running partition"));
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(ErrorCode::HandlerNotFound.as_str(), "handler_not_found");
        assert_eq!(ErrorCode::StuckJob.as_str(), "stuck_job");
    }
}
