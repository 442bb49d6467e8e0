//! Worker lifecycle notifications
//!
//! The engine reports what it does through a closed set of [`WorkerEvent`]s
//! delivered to pluggable [`EventSink`]s. Sinks are observers: a sink that
//! fails or panics is logged and skipped, and never affects scheduling or
//! the outcome of a job.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::error;

use crate::persistence::Job;
use crate::task::TaskError;
use crate::worker::{ClaimError, WorkerError};

/// A lifecycle notification
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A worker was constructed
    WorkerCreated {
        worker_id: String,
        tasks: Vec<String>,
    },
    /// A claim request is about to be issued
    ClaimStarted { worker_id: String },
    /// The claim found no eligible job
    ClaimEmpty { worker_id: String },
    /// The claim failed
    ClaimError { worker_id: String, error: ClaimError },
    /// A claimed job is about to run
    JobStarted { worker_id: String, job: Arc<Job> },
    /// An attempt failed
    JobError {
        worker_id: String,
        job: Arc<Job>,
        error: TaskError,
        batch_item_errors: Option<Vec<TaskError>>,
    },
    /// An attempt failed and no attempts remain
    JobPermanentlyFailed {
        worker_id: String,
        job: Arc<Job>,
        error: TaskError,
        batch_item_errors: Option<Vec<TaskError>>,
    },
    /// An attempt succeeded
    JobSucceeded { worker_id: String, job: Arc<Job> },
    /// The outcome of an attempt was recorded
    JobCompleted {
        worker_id: String,
        job: Arc<Job>,
        error: Option<TaskError>,
    },
    /// The worker was released and will not claim again
    WorkerReleased { worker_id: String },
    /// The worker's termination outcome is settled
    WorkerStopped {
        worker_id: String,
        error: Option<WorkerError>,
    },
    /// Recording the outcome of a job failed; the worker stops
    WorkerFatalError {
        worker_id: String,
        error: WorkerError,
        job_error: Option<TaskError>,
    },
}

impl WorkerEvent {
    /// Stable event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkerCreated { .. } => "worker-created",
            Self::ClaimStarted { .. } => "claim-started",
            Self::ClaimEmpty { .. } => "claim-empty",
            Self::ClaimError { .. } => "claim-error",
            Self::JobStarted { .. } => "job-started",
            Self::JobError { .. } => "job-error",
            Self::JobPermanentlyFailed { .. } => "job-permanently-failed",
            Self::JobSucceeded { .. } => "job-succeeded",
            Self::JobCompleted { .. } => "job-completed",
            Self::WorkerReleased { .. } => "worker-released",
            Self::WorkerStopped { .. } => "worker-stopped",
            Self::WorkerFatalError { .. } => "worker-fatal-error",
        }
    }

    /// Id of the worker that emitted the event
    pub fn worker_id(&self) -> &str {
        match self {
            Self::WorkerCreated { worker_id, .. }
            | Self::ClaimStarted { worker_id }
            | Self::ClaimEmpty { worker_id }
            | Self::ClaimError { worker_id, .. }
            | Self::JobStarted { worker_id, .. }
            | Self::JobError { worker_id, .. }
            | Self::JobPermanentlyFailed { worker_id, .. }
            | Self::JobSucceeded { worker_id, .. }
            | Self::JobCompleted { worker_id, .. }
            | Self::WorkerReleased { worker_id }
            | Self::WorkerStopped { worker_id, .. }
            | Self::WorkerFatalError { worker_id, .. } => worker_id,
        }
    }

    /// Job the event is about, if any
    pub fn job(&self) -> Option<&Job> {
        match self {
            Self::JobStarted { job, .. }
            | Self::JobError { job, .. }
            | Self::JobPermanentlyFailed { job, .. }
            | Self::JobSucceeded { job, .. }
            | Self::JobCompleted { job, .. } => Some(job),
            _ => None,
        }
    }
}

/// Error returned by a sink
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct SinkError(pub String);

impl From<anyhow::Error> for SinkError {
    fn from(err: anyhow::Error) -> Self {
        Self(err.to_string())
    }
}

/// Receiver of lifecycle notifications
///
/// Called synchronously on the emitting worker's task, so implementations
/// should hand heavy work off (the `UnboundedSender` impl does exactly that).
pub trait EventSink: Send + Sync + 'static {
    fn handle(&self, event: &WorkerEvent) -> Result<(), SinkError>;
}

impl<F> EventSink for F
where
    F: Fn(&WorkerEvent) -> Result<(), SinkError> + Send + Sync + 'static,
{
    fn handle(&self, event: &WorkerEvent) -> Result<(), SinkError> {
        self(event)
    }
}

impl EventSink for mpsc::UnboundedSender<WorkerEvent> {
    fn handle(&self, event: &WorkerEvent) -> Result<(), SinkError> {
        self.send(event.clone())
            .map_err(|_| SinkError("event receiver dropped".to_string()))
    }
}

/// Fans events out to every registered sink, isolating failures
#[derive(Clone, Default)]
pub struct EventDispatcher {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventDispatcher {
    /// Create a dispatcher with no sinks
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Number of registered sinks
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Deliver an event to every sink
    pub fn emit(&self, event: WorkerEvent) {
        for sink in &self.sinks {
            match std::panic::catch_unwind(AssertUnwindSafe(|| sink.handle(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        event = event.name(),
                        worker_id = event.worker_id(),
                        error = %e,
                        "Event sink failed; this is a bug in the sink, not the job"
                    );
                }
                Err(panic) => {
                    let message = crate::task::TaskError::from_panic(panic).message;
                    error!(
                        event = event.name(),
                        worker_id = event.worker_id(),
                        panic = %message,
                        "Event sink panicked; this is a bug in the sink, not the job"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn released(worker_id: &str) -> WorkerEvent {
        WorkerEvent::WorkerReleased {
            worker_id: worker_id.to_string(),
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(released("w").name(), "worker-released");
        assert_eq!(released("w").worker_id(), "w");
        assert!(released("w").job().is_none());
    }

    #[test]
    fn test_failing_sinks_do_not_stop_delivery() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let mut dispatcher = EventDispatcher::new();
        dispatcher.add_sink(Arc::new(|_: &WorkerEvent| -> Result<(), SinkError> {
            Err(SinkError("sink is broken".to_string()))
        }));
        dispatcher.add_sink(Arc::new(|_: &WorkerEvent| -> Result<(), SinkError> {
            panic!("sink exploded")
        }));
        dispatcher.add_sink(Arc::new(move |event: &WorkerEvent| -> Result<(), SinkError> {
            seen_clone.lock().push(event.name());
            Ok(())
        }));

        dispatcher.emit(released("w"));
        dispatcher.emit(released("w"));

        assert_eq!(*seen.lock(), vec!["worker-released", "worker-released"]);
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = EventDispatcher::new();
        dispatcher.add_sink(Arc::new(tx));

        dispatcher.emit(released("w1"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.worker_id(), "w1");
    }
}
