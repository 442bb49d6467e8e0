//! Execution helpers handed to every task invocation

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::persistence::{Job, JobSource, NewJob, StoreError};

/// Helpers available to a task while it runs one job
///
/// The helpers provide:
/// - The claimed job (attempt count, key, flags...)
/// - A cancellation token fired on graceful shutdown
/// - A logger span scoped to the worker and job
/// - Access to the job store for enqueuing follow-up work
///
/// # Example
///
/// ```ignore
/// async fn run(&self, payload: Payload, helpers: JobHelpers) -> TaskResult {
///     for chunk in payload.chunks {
///         if helpers.is_cancelled() {
///             return Err(TaskError::new("cancelled"));
///         }
///         helpers.logger().in_scope(|| tracing::debug!(chunk, "processing"));
///         process(chunk).await?;
///     }
///     helpers.add_job(NewJob::new("notify_done", json!({}))).await?;
///     Ok(TaskOutput::Done)
/// }
/// ```
#[derive(Clone)]
pub struct JobHelpers {
    job: Arc<Job>,
    worker_id: String,
    cancellation: CancellationToken,
    logger: Span,
    source: Arc<dyn JobSource>,
}

impl JobHelpers {
    pub(crate) fn new(
        job: Arc<Job>,
        worker_id: impl Into<String>,
        cancellation: CancellationToken,
        logger: Span,
        source: Arc<dyn JobSource>,
    ) -> Self {
        Self {
            job,
            worker_id: worker_id.into(),
            cancellation,
            logger,
            source,
        }
    }

    /// The job being executed
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Id of the worker executing the job
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Whether cooperative cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// The cancellation token itself, for passing to other libraries
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Span scoped to this worker and job
    pub fn logger(&self) -> &Span {
        &self.logger
    }

    /// Job store the job was claimed from
    pub fn source(&self) -> &Arc<dyn JobSource> {
        &self.source
    }

    /// Enqueue another job
    pub async fn add_job(&self, job: NewJob) -> Result<Job, StoreError> {
        self.source.add_job(job).await
    }

    /// Whether a failure of this attempt would be permanent
    pub fn is_last_attempt(&self) -> bool {
        !self.job.has_attempts_remaining()
    }
}

impl std::fmt::Debug for JobHelpers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHelpers")
            .field("job_id", &self.job.id)
            .field("worker_id", &self.worker_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryJobSource;
    use serde_json::json;

    async fn helpers_for(source: Arc<InMemoryJobSource>, max_attempts: i16) -> JobHelpers {
        source
            .add_job(NewJob::new("t", json!({})).with_max_attempts(max_attempts))
            .await
            .unwrap();
        let ids: Vec<_> = source
            .register_tasks(&["t".to_string()])
            .await
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let job = source.claim("w", &ids, None).await.unwrap().unwrap();

        JobHelpers::new(
            Arc::new(job),
            "w",
            CancellationToken::new(),
            Span::none(),
            source,
        )
    }

    #[tokio::test]
    async fn test_cancellation_is_visible() {
        let token = CancellationToken::new();
        let source = Arc::new(InMemoryJobSource::new());
        let mut helpers = helpers_for(source, 3).await;
        helpers.cancellation = token.clone();

        assert!(!helpers.is_cancelled());
        token.cancel();
        assert!(helpers.is_cancelled());
        helpers.cancelled().await;
    }

    #[tokio::test]
    async fn test_last_attempt() {
        let source = Arc::new(InMemoryJobSource::new());
        assert!(helpers_for(source.clone(), 1).await.is_last_attempt());
        assert!(!helpers_for(source, 3).await.is_last_attempt());
    }

    #[tokio::test]
    async fn test_add_job_goes_to_source() {
        let source = Arc::new(InMemoryJobSource::new());
        let helpers = helpers_for(source.clone(), 3).await;

        helpers
            .add_job(NewJob::new("follow_up", json!({"n": 1})))
            .await
            .unwrap();

        assert_eq!(source.job_count(), 2);
    }
}
