//! Task list: handlers keyed by task identifier
//!
//! The list maps task identifiers to type-erased handlers with one uniform
//! invocation signature. Looking up an identifier that is not registered is
//! an ordinary error, turned into a failed attempt by the invoker.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use super::{JobHelpers, Task, TaskResult};

/// Type-erased task handler
pub type TaskHandler = Arc<dyn Fn(Value, JobHelpers) -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// Error from handler lookup
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskLookupError {
    /// No handler registered under this identifier
    #[error("Unsupported task '{0}'")]
    Unsupported(String),
}

/// Handlers available to a worker
#[derive(Clone, Default)]
pub struct TaskList {
    handlers: HashMap<String, TaskHandler>,
}

impl TaskList {
    /// Create an empty task list
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a [`Task`] implementation
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut tasks = TaskList::new();
    /// tasks.register(SendEmail::new(mailer));
    /// ```
    pub fn register<T: Task>(&mut self, task: T) -> &mut Self {
        let task = Arc::new(task);
        let handler: TaskHandler = Arc::new(move |payload, helpers| {
            run_typed(Arc::clone(&task), payload, helpers).boxed()
        });
        self.handlers.insert(T::IDENTIFIER.to_string(), handler);
        self
    }

    /// Register a closure under the given identifier
    pub fn register_fn<F, Fut>(&mut self, identifier: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Value, JobHelpers) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |payload, helpers| f(payload, helpers).boxed());
        self.handlers.insert(identifier.into(), handler);
        self
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_task<T: Task>(mut self, task: T) -> Self {
        self.register(task);
        self
    }

    /// Builder form of [`register_fn`](Self::register_fn)
    pub fn with_fn<F, Fut>(mut self, identifier: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, JobHelpers) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.register_fn(identifier, f);
        self
    }

    /// Look up the handler for an identifier
    pub fn get(&self, identifier: &str) -> Result<&TaskHandler, TaskLookupError> {
        self.handlers
            .get(identifier)
            .ok_or_else(|| TaskLookupError::Unsupported(identifier.to_string()))
    }

    /// Check if an identifier is registered
    pub fn contains(&self, identifier: &str) -> bool {
        self.handlers.contains_key(identifier)
    }

    /// Registered identifiers, sorted
    pub fn identifiers(&self) -> Vec<String> {
        let mut identifiers: Vec<String> = self.handlers.keys().cloned().collect();
        identifiers.sort();
        identifiers
    }

    /// Number of registered tasks
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if no task is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

async fn run_typed<T: Task>(task: Arc<T>, payload: Value, helpers: JobHelpers) -> TaskResult {
    let payload: T::Payload = serde_json::from_value(payload)?;
    task.run(payload, helpers).await
}

impl fmt::Debug for TaskList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskList")
            .field("identifiers", &self.identifiers())
            .finish()
    }
}
