//! # Job Execution Engine
//!
//! A database-backed job queue worker: workers repeatedly claim one runnable
//! job from a shared store, run the registered handler for its task, and
//! record success or failure so the store can delete, retry or give up on it.
//!
//! ## Features
//!
//! - **Exclusive claims**: each job is locked by exactly one worker at a time
//! - **Retries**: failed jobs are rescheduled with exponential backoff until
//!   their attempts run out
//! - **Batch jobs**: array payloads may fail per element; only failed elements
//!   are retried
//! - **Lifecycle events**: every claim, job and worker transition is published
//!   to registered sinks
//! - **Graceful shutdown**: in-flight jobs finish, then workers stop
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                               │
//! │  (config, event sinks, hooks, task identifier cache)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 WorkerPool / Worker                          │
//! │  (claim → run task → complete / fail, poll when idle)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        JobSource                             │
//! │  (PostgreSQL: taskq.jobs, taskq.tasks, taskq.job_queues)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use taskq::prelude::*;
//!
//! let tasks = TaskList::new().with_fn("send_email", |payload, helpers| async move {
//!     tracing::info!(parent: helpers.logger(), ?payload, "sending");
//!     Ok(TaskOutput::Done)
//! });
//!
//! let store = Arc::new(PostgresJobSource::new(pool));
//! store.install_schema().await?;
//!
//! let engine = Engine::new(WorkerConfig::from_env());
//! let workers = Arc::new(WorkerPool::start(engine, store, tasks));
//! workers.graceful_shutdown().await?;
//! ```

pub mod config;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod task;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ForbiddenFlags, WorkerConfig};
    pub use crate::engine::{Engine, EngineBuilder, EventSink, SinkError, WorkerEvent, WorkerHooks};
    pub use crate::persistence::{
        InMemoryJobSource, Job, JobId, JobSource, NewJob, PostgresJobSource, StoreError,
    };
    pub use crate::reliability::BackoffPolicy;
    pub use crate::task::{JobHelpers, Task, TaskError, TaskList, TaskOutput, TaskResult};
    pub use crate::worker::{run_once, Worker, WorkerError, WorkerPool, WorkerPoolError};
    pub use async_trait::async_trait;
    pub use std::sync::Arc;
}

// Re-export key types at crate root
pub use config::{ForbiddenFlags, WorkerConfig};
pub use engine::{
    Engine, EngineBuilder, EngineHandle, EventSink, SinkError, StartWorkerContext, WorkerEvent,
    WorkerHooks,
};
pub use persistence::{
    InMemoryJobSource, Job, JobId, JobInsertListener, JobSource, NewJob, PostgresJobSource,
    RescheduleOptions, StoreError, TaskId,
};
pub use reliability::BackoffPolicy;
pub use task::{JobHelpers, Task, TaskError, TaskList, TaskOutput, TaskResult};
pub use worker::{
    run_once, ClaimError, Worker, WorkerError, WorkerOutcome, WorkerParams, WorkerPool,
    WorkerPoolError, WorkerState,
};
