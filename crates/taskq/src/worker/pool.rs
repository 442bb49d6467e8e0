//! Worker pool
//!
//! Runs `concurrency` workers against one store with a shared engine, spreads
//! nudges across them and coordinates graceful or forced shutdown.

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::error::{WorkerOutcome, WorkerPoolError};
use super::machine::{Worker, WorkerParams};
use crate::engine::Engine;
use crate::persistence::JobSource;
use crate::task::TaskList;

/// A set of workers sharing one engine and one store
///
/// # Example
///
/// ```ignore
/// let engine = Engine::new(WorkerConfig::from_env());
/// let pool = WorkerPool::start(engine, store, tasks);
///
/// // ... later
/// pool.graceful_shutdown().await?;
/// ```
pub struct WorkerPool {
    engine: Engine,
    workers: Vec<Worker>,
    /// Handed to every task; fired when the grace period runs out
    cancellation: CancellationToken,
    /// Fired as soon as shutdown begins
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawn `engine.config().concurrency` workers
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(engine: Engine, source: Arc<dyn JobSource>, tasks: TaskList) -> Self {
        let cancellation = CancellationToken::new();
        let concurrency = engine.config().concurrency.max(1);

        let workers = (0..concurrency)
            .map(|_| {
                let params = WorkerParams::from_config(engine.config())
                    .with_cancellation(cancellation.clone());
                Worker::spawn(engine.clone(), Arc::clone(&source), tasks.clone(), params)
            })
            .collect();

        info!(
            engine = %engine.handle(),
            concurrency,
            tasks = tasks.len(),
            "Worker pool started"
        );

        Self {
            engine,
            workers,
            cancellation,
            shutdown: CancellationToken::new(),
        }
    }

    /// Engine shared by the workers
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Worker handles
    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Token fired when shutdown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Token handed to running tasks
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Nudge idle workers until `count` of them accepted
    ///
    /// Returns how many accepted.
    pub fn nudge(&self, count: usize) -> usize {
        let mut accepted = 0;
        for worker in &self.workers {
            if accepted >= count {
                break;
            }
            if worker.nudge() {
                accepted += 1;
            }
        }
        accepted
    }

    /// Release every worker and wait for in-flight jobs
    ///
    /// Jobs still running after the grace period are signalled through the
    /// cancellation token. Their handlers are still awaited and their
    /// outcomes recorded before this returns; use [`Self::force_shutdown`]
    /// to stop without waiting.
    #[instrument(skip(self), fields(engine = %self.engine.handle()))]
    pub async fn graceful_shutdown(&self) -> Result<(), WorkerPoolError> {
        info!("Initiating graceful shutdown");
        self.shutdown.cancel();

        let releases = join_all(self.workers.iter().map(|w| w.release(false)));
        tokio::pin!(releases);

        let outcomes = tokio::select! {
            outcomes = &mut releases => outcomes,
            _ = tokio::time::sleep(self.engine.config().grace_period) => {
                warn!(
                    grace_period_ms = self.engine.config().grace_period.as_millis() as u64,
                    "Grace period elapsed; cancelling running jobs"
                );
                self.cancellation.cancel();
                releases.await
            }
        };

        info!("Worker pool stopped");
        self.first_error(outcomes)
    }

    /// Cancel running jobs and release every worker without waiting
    pub async fn force_shutdown(&self) -> Result<(), WorkerPoolError> {
        warn!(engine = %self.engine.handle(), "Forcing shutdown");
        self.shutdown.cancel();
        self.cancellation.cancel();

        let outcomes = join_all(self.workers.iter().map(|w| w.release(true))).await;
        self.first_error(outcomes)
    }

    /// Wait until every worker stopped on its own
    pub async fn wait(&self) -> Result<(), WorkerPoolError> {
        let outcomes = join_all(self.workers.iter().map(Worker::wait)).await;
        self.first_error(outcomes)
    }

    fn first_error(&self, outcomes: Vec<WorkerOutcome>) -> Result<(), WorkerPoolError> {
        for (worker, outcome) in self.workers.iter().zip(outcomes) {
            if let Err(error) = outcome {
                return Err(WorkerPoolError::Worker {
                    worker_id: worker.worker_id().to_string(),
                    error,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("engine", &self.engine.handle())
            .field("workers", &self.workers)
            .finish()
    }
}

/// Run a single one-shot worker until the queue has nothing runnable
pub async fn run_once(engine: Engine, source: Arc<dyn JobSource>, tasks: TaskList) -> WorkerOutcome {
    let mut params = WorkerParams::from_config(engine.config());
    params.continuous = false;
    params.autostart = true;

    let worker = Worker::spawn(engine, source, tasks, params);
    debug!(worker_id = worker.worker_id(), "Running once");
    worker.wait().await
}
