// Telemetry Module
//
// This module provides tracing integration for taskq, including:
// - Field names shared by every worker and job span
// - Initialization helper for the console subscriber
// - Span creation helpers

use tracing::Span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::persistence::Job;

// ============================================================================
// Field Names
// ============================================================================

/// Structured field names used across worker and job spans
pub mod fields {
    /// Id of the worker owning the span
    pub const WORKER_ID: &str = "worker_id";
    /// Durable job id
    pub const JOB_ID: &str = "job_id";
    /// Task identifier the job runs
    pub const TASK_IDENTIFIER: &str = "task_identifier";
    /// Attempt number (post-increment)
    pub const ATTEMPTS: &str = "attempts";
    /// Wall time spent in the handler
    pub const DURATION_MS: &str = "duration_ms";
}

// ============================================================================
// Telemetry Configuration
// ============================================================================

/// Configuration for log output
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Whether to enable console logging
    pub enable_console: bool,
    /// Log filter (e.g., "info", "debug", "taskq=debug")
    pub log_filter: Option<String>,
    /// Include the event target in each line
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_console: true,
            log_filter: None,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `TASKQ_LOG_CONSOLE`: set to "false" to disable console output
    pub fn from_env() -> Self {
        Self {
            enable_console: std::env::var("TASKQ_LOG_CONSOLE")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            with_target: true,
        }
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize the global tracing subscriber
///
/// Returns `false` when a subscriber was already installed, in which case
/// the existing one is kept.
///
/// # Example
///
/// ```ignore
/// use taskq::telemetry::{init_telemetry, TelemetryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     init_telemetry(TelemetryConfig::from_env());
///     // ... run workers
/// }
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> bool {
    let filter = config
        .log_filter
        .as_ref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let console_layer = if config.enable_console {
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(config.with_target)
                .with_filter(filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .is_ok()
}

// ============================================================================
// Span Helpers
// ============================================================================

/// Span covering the whole life of a worker
pub fn worker_span(worker_id: &str) -> Span {
    tracing::info_span!("worker", worker_id = %worker_id)
}

/// Span handed to a task handler as its logger
pub fn job_span(worker_id: &str, job: &Job) -> Span {
    tracing::info_span!(
        "job",
        worker_id = %worker_id,
        job_id = %job.id,
        task_identifier = %job.task_identifier,
        attempts = job.attempts,
        duration_ms = tracing::field::Empty,
    )
}
