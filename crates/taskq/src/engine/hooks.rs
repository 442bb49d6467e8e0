//! Worker start/stop hooks

use async_trait::async_trait;

use crate::worker::WorkerError;

/// State a start hook may inspect and adjust before the first claim
#[derive(Debug, Clone, PartialEq)]
pub struct StartWorkerContext {
    pub worker_id: String,
    /// Task identifiers the worker supports
    pub tasks: Vec<String>,
    /// Flags the first claim will skip; hooks may replace them
    pub flags_to_skip: Option<Vec<String>>,
}

/// Hooks run around a worker's life
///
/// Both methods default to no-ops.
#[async_trait]
pub trait WorkerHooks: Send + Sync + 'static {
    /// Runs once, before the worker's first claim
    async fn start_worker(&self, _ctx: &mut StartWorkerContext) {}

    /// Runs once, when the worker's termination outcome is settled
    async fn stop_worker(&self, _worker_id: &str, _error: Option<&WorkerError>) {}
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl WorkerHooks for NoopHooks {}
