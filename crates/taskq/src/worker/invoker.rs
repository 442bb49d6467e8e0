//! Task invocation and outcome classification
//!
//! Runs one claimed job through its handler, decides whether the attempt
//! succeeded, failed, or partially failed as a batch, and records the
//! outcome with the store. Lifecycle events are emitted in a fixed order:
//! started, then error / permanently-failed or succeeded, then completed.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use super::error::WorkerError;
use crate::engine::{EventDispatcher, WorkerEvent};
use crate::persistence::{Job, JobSource};
use crate::task::{JobHelpers, TaskError, TaskList, TaskOutput, TaskResult};
use crate::telemetry;

/// Failed elements of a batch payload
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BatchFailure {
    /// Original payload elements whose item failed, in payload order
    pub failed_payloads: Vec<Value>,
    /// Failure reason for each failed element
    pub errors: Vec<TaskError>,
}

/// How an attempt ended, before it is recorded
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum JobOutcome {
    Success,
    Failure {
        error: TaskError,
        batch: Option<BatchFailure>,
    },
}

/// Interpret a handler result
///
/// Only an [`TaskOutput::Items`] result for an array payload takes the batch
/// path. A length mismatch between the two is logged and counted as success.
pub(crate) async fn classify(job: &Job, result: TaskResult) -> JobOutcome {
    let output = match result {
        Ok(output) => output,
        Err(error) => return JobOutcome::Failure { error, batch: None },
    };

    let (Some(payload), TaskOutput::Items(items)) = (job.payload.as_array(), output) else {
        return JobOutcome::Success;
    };

    if payload.len() != items.len() {
        warn!(
            job_id = %job.id,
            task_identifier = %job.task_identifier,
            payload_len = payload.len(),
            results_len = items.len(),
            "Task returned an invalid value: expected nothing or one result per payload entry; treating as full success, but this is a bug in the task"
        );
        return JobOutcome::Success;
    }

    let settled = join_all(
        items
            .into_iter()
            .map(|item| AssertUnwindSafe(item).catch_unwind()),
    )
    .await;

    let mut failed_payloads = Vec::new();
    let mut errors = Vec::new();
    for (entry, result) in payload.iter().zip(settled) {
        let result = result.unwrap_or_else(|panic| Err(TaskError::from_panic(panic)));
        if let Err(error) = result {
            failed_payloads.push(entry.clone());
            errors.push(error);
        }
    }

    if errors.is_empty() {
        return JobOutcome::Success;
    }

    let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    JobOutcome::Failure {
        error: TaskError::new(format!("Batch failures:\n{}", messages.join("\n")))
            .with_type("batch"),
        batch: Some(BatchFailure {
            failed_payloads,
            errors,
        }),
    }
}

/// Runs claimed jobs for one worker
pub(crate) struct TaskInvoker {
    worker_id: String,
    tasks: TaskList,
    source: Arc<dyn JobSource>,
    events: EventDispatcher,
    cancellation: CancellationToken,
    log_success: bool,
}

impl TaskInvoker {
    pub(crate) fn new(
        worker_id: String,
        tasks: TaskList,
        source: Arc<dyn JobSource>,
        events: EventDispatcher,
        cancellation: CancellationToken,
        log_success: bool,
    ) -> Self {
        Self {
            worker_id,
            tasks,
            source,
            events,
            cancellation,
            log_success,
        }
    }

    /// Execute one job and record its outcome
    ///
    /// Returns an error only when recording the outcome failed, in which
    /// case the worker must stop.
    pub(crate) async fn run(&self, job: Arc<Job>) -> Result<(), WorkerError> {
        self.events.emit(WorkerEvent::JobStarted {
            worker_id: self.worker_id.clone(),
            job: Arc::clone(&job),
        });

        let span = telemetry::job_span(&self.worker_id, &job);
        let started = Instant::now();
        let result = self.execute(&job, span.clone()).await;
        let outcome = classify(&job, result).await;
        let duration = started.elapsed();
        span.record(telemetry::fields::DURATION_MS, duration.as_millis() as u64);

        self.finalize(job, outcome, duration).instrument(span).await
    }

    async fn execute(&self, job: &Arc<Job>, span: Span) -> TaskResult {
        debug!(job_id = %job.id, task_identifier = %job.task_identifier, "Found job");

        let handler = self
            .tasks
            .get(&job.task_identifier)
            .map_err(|e| TaskError::new(e.to_string()).with_type("unsupported_task"))?;

        let helpers = JobHelpers::new(
            Arc::clone(job),
            self.worker_id.clone(),
            self.cancellation.clone(),
            span.clone(),
            Arc::clone(&self.source),
        );

        let payload = job.payload.clone();
        let invocation = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(payload, helpers))) {
            Ok(invocation) => invocation,
            Err(panic) => return Err(TaskError::from_panic(panic)),
        };

        match AssertUnwindSafe(invocation).catch_unwind().instrument(span).await {
            Ok(result) => result,
            Err(panic) => Err(TaskError::from_panic(panic)),
        }
    }

    async fn finalize(
        &self,
        job: Arc<Job>,
        outcome: JobOutcome,
        duration: Duration,
    ) -> Result<(), WorkerError> {
        let duration_ms = duration.as_secs_f64() * 1e3;

        let (job_error, recorded) = match outcome {
            JobOutcome::Failure { error, batch } => {
                let batch_item_errors = batch.as_ref().map(|b| b.errors.clone());

                self.events.emit(WorkerEvent::JobError {
                    worker_id: self.worker_id.clone(),
                    job: Arc::clone(&job),
                    error: error.clone(),
                    batch_item_errors: batch_item_errors.clone(),
                });

                if job.attempts >= job.max_attempts {
                    self.events.emit(WorkerEvent::JobPermanentlyFailed {
                        worker_id: self.worker_id.clone(),
                        job: Arc::clone(&job),
                        error: error.clone(),
                        batch_item_errors,
                    });
                }

                // Display never yields an empty string
                let message = error.to_string();
                error!(
                    job_id = %job.id,
                    task_identifier = %job.task_identifier,
                    duration_ms,
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    error = %message,
                    trace = error.trace.as_deref().unwrap_or(""),
                    "Failed task"
                );

                let replacement = batch.map(|b| Value::Array(b.failed_payloads));
                let recorded = self
                    .source
                    .fail(&self.worker_id, &job, &message, replacement)
                    .await;
                (Some(error), recorded)
            }
            JobOutcome::Success => {
                self.events.emit(WorkerEvent::JobSucceeded {
                    worker_id: self.worker_id.clone(),
                    job: Arc::clone(&job),
                });

                if self.log_success {
                    info!(
                        job_id = %job.id,
                        task_identifier = %job.task_identifier,
                        duration_ms,
                        attempts = job.attempts,
                        max_attempts = job.max_attempts,
                        "Completed task with success"
                    );
                }

                let recorded = self.source.complete(&self.worker_id, &job).await;
                (None, recorded)
            }
        };

        if let Err(store_error) = recorded {
            let fatal = WorkerError::Bookkeeping {
                job_id: job.id,
                error: store_error,
            };

            self.events.emit(WorkerEvent::WorkerFatalError {
                worker_id: self.worker_id.clone(),
                error: fatal.clone(),
                job_error: job_error.clone(),
            });

            let when = match &job_error {
                Some(e) => format!("after failure '{}'", e),
                None => "after success".to_string(),
            };
            error!(
                job_id = %job.id,
                error = %fatal,
                "Failed to release job {}; stopping worker",
                when
            );
            return Err(fatal);
        }

        self.events.emit(WorkerEvent::JobCompleted {
            worker_id: self.worker_id.clone(),
            job,
            error: job_error,
        });
        Ok(())
    }
}
