//! Task trait definition

use std::any::Any;
use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::JobHelpers;

/// Error type for task failures
///
/// Every handler failure becomes a failed attempt; whether the job is
/// retried depends only on its remaining attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,

    /// Captured error chain or panic location
    pub trace: Option<String>,
}

impl TaskError {
    /// Create a new error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            details: None,
            trace: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach a trace
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Convert a caught panic payload into an error
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };
        Self::new(message).with_type("panic")
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            match &self.error_type {
                Some(error_type) => write!(f, "{} (no message)", error_type),
                None => write!(f, "task failed without a message"),
            }
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for TaskError {}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string()).with_trace(format!("{:?}", err))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("invalid payload: {}", err)).with_type("payload")
    }
}

/// Pending outcome of one element of a batch payload
pub type ItemOutcome = BoxFuture<'static, Result<(), TaskError>>;

/// Result returned by every task handler
pub type TaskResult = Result<TaskOutput, TaskError>;

/// What a handler reported on success
///
/// Only [`TaskOutput::Items`] returned for a job whose payload is an array
/// takes the batch path; every other shape counts as plain success.
pub enum TaskOutput {
    /// Completed with nothing to report
    Done,
    /// Completed with a value (kept for logging only)
    Value(serde_json::Value),
    /// One outcome per payload element, settled independently
    Items(Vec<ItemOutcome>),
}

impl TaskOutput {
    /// Per-item outcomes from futures
    pub fn items<I, F>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self::Items(outcomes.into_iter().map(|f| f.boxed()).collect())
    }

    /// Per-item outcomes that have already settled
    pub fn from_results<I>(results: I) -> Self
    where
        I: IntoIterator<Item = Result<(), TaskError>>,
    {
        Self::items(results.into_iter().map(futures::future::ready))
    }
}

impl fmt::Debug for TaskOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => write!(f, "Done"),
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Items(items) => write!(f, "Items(<{} pending>)", items.len()),
        }
    }
}

impl From<()> for TaskOutput {
    fn from(_: ()) -> Self {
        Self::Done
    }
}

impl From<serde_json::Value> for TaskOutput {
    fn from(value: serde_json::Value) -> Self {
        Self::Value(value)
    }
}

/// A task is a named handler for one kind of job
///
/// # Example
///
/// ```ignore
/// use taskq::prelude::*;
///
/// struct SendEmail;
///
/// #[async_trait]
/// impl Task for SendEmail {
///     const IDENTIFIER: &'static str = "send_email";
///     type Payload = SendEmailPayload;
///
///     async fn run(&self, payload: Self::Payload, helpers: JobHelpers) -> TaskResult {
///         if helpers.is_cancelled() {
///             return Err(TaskError::new("shutting down"));
///         }
///         mailer.send(&payload.to).await?;
///         Ok(TaskOutput::Done)
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Identifier jobs use to select this task
    const IDENTIFIER: &'static str;

    /// Payload type, deserialized from the job payload
    type Payload: Serialize + DeserializeOwned + Send;

    /// Run one attempt
    ///
    /// A payload that fails to deserialize fails the attempt before `run`
    /// is called.
    async fn run(&self, payload: Self::Payload, helpers: JobHelpers) -> TaskResult;
}
