//! Per-worker polling state machine
//!
//! Each [`Worker`] owns one strictly sequential loop: claim a job, run it,
//! record the outcome, repeat. Only empty polls and claim errors wait for
//! the poll interval; finishing a job starts the next claim immediately.
//!
//! ```text
//!            start / autostart
//!   Idle ─────────────────────► AwaitingClaim ◄─────────────┐
//!                                 │      │                   │
//!                          job    │      │ empty / error     │ timer, nudge
//!                                 ▼      ▼                   │
//!                          Executing   WaitingRetryTimer ────┘
//!                                 │
//!                                 └──► next claim immediately
//!
//!   release(): ──► Stopping (claim or job in flight) ──► Stopped
//! ```

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument, Level};
use uuid::Uuid;

use super::error::{ClaimError, WorkerError, WorkerOutcome};
use super::invoker::TaskInvoker;
use crate::config::WorkerConfig;
use crate::engine::{Engine, StartWorkerContext, WorkerEvent};
use crate::persistence::{Job, JobSource};
use crate::task::TaskList;
use crate::telemetry;

/// Observable worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Not started yet (manual start pending)
    Idle,
    /// Claim request in flight
    AwaitingClaim,
    /// Handler running or outcome being recorded
    Executing,
    /// Waiting for the poll interval before the next claim
    WaitingRetryTimer,
    /// Released while a claim or job is still in flight
    Stopping,
    /// Terminal
    Stopped,
}

/// Per-worker parameters
#[derive(Debug, Clone)]
pub struct WorkerParams {
    /// Worker id; generated when not set
    pub worker_id: Option<String>,
    /// Keep polling after an empty claim
    pub continuous: bool,
    /// Start claiming immediately
    pub autostart: bool,
    /// Cooperative cancellation signal handed to every task
    pub cancellation: CancellationToken,
}

impl WorkerParams {
    /// Parameters taken from a worker configuration
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            worker_id: None,
            continuous: config.continuous,
            autostart: config.autostart,
            cancellation: CancellationToken::new(),
        }
    }

    /// Set the worker id
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Share a cancellation token
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

fn generate_worker_id() -> String {
    format!("worker-{}", Uuid::now_v7().simple())
}

struct Control {
    state: WorkerState,
    active: bool,
    started: bool,
    in_cycle: bool,
    waiting: bool,
    again: bool,
    contiguous_errors: u32,
    active_job: Option<Arc<Job>>,
}

impl Control {
    fn enter(&mut self, state: WorkerState) {
        self.state = if self.active {
            state
        } else {
            WorkerState::Stopping
        };
    }
}

enum Step {
    /// Claim again right away
    Continue,
    /// Claim again after the poll interval; `nudgeable` waits end early
    /// when a nudge arrived since the claim started
    Wait { nudgeable: bool },
    /// Leave the loop with this outcome
    Stop(WorkerOutcome),
}

struct Inner {
    worker_id: String,
    engine: Engine,
    source: Arc<dyn JobSource>,
    identifiers: Vec<String>,
    continuous: bool,
    invoker: TaskInvoker,
    control: Mutex<Control>,
    wake: Notify,
    outcome_tx: Mutex<Option<oneshot::Sender<WorkerOutcome>>>,
    done: watch::Receiver<Option<WorkerOutcome>>,
}

/// Level for a failed claim: the first failure of a run is routine, repeated
/// ones point at an unavailable store
fn claim_error_level(contiguous_errors: u32) -> Level {
    if contiguous_errors > 1 {
        Level::WARN
    } else {
        Level::DEBUG
    }
}

/// Handle to a worker
///
/// Cloning the handle does not clone the worker.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    /// Construct a worker and, with `autostart`, begin claiming
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        engine: Engine,
        source: Arc<dyn JobSource>,
        tasks: TaskList,
        params: WorkerParams,
    ) -> Self {
        let worker_id = params.worker_id.unwrap_or_else(generate_worker_id);
        let identifiers = tasks.identifiers();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(None);

        let invoker = TaskInvoker::new(
            worker_id.clone(),
            tasks,
            Arc::clone(&source),
            engine.events().clone(),
            params.cancellation,
            engine.config().log_success,
        );

        let inner = Arc::new(Inner {
            worker_id: worker_id.clone(),
            engine: engine.clone(),
            source,
            identifiers: identifiers.clone(),
            continuous: params.continuous,
            invoker,
            control: Mutex::new(Control {
                state: if params.autostart {
                    WorkerState::AwaitingClaim
                } else {
                    WorkerState::Idle
                },
                active: true,
                started: params.autostart,
                in_cycle: false,
                waiting: false,
                again: false,
                contiguous_errors: 0,
                active_job: None,
            }),
            wake: Notify::new(),
            outcome_tx: Mutex::new(Some(outcome_tx)),
            done: done_rx,
        });

        // Runs once the outcome is settled, however that happens
        let finalizer_id = worker_id.clone();
        let finalizer_engine = engine.clone();
        tokio::spawn(async move {
            let outcome = outcome_rx.await.unwrap_or(Err(WorkerError::Aborted));
            finalizer_engine
                .hooks()
                .stop_worker(&finalizer_id, outcome.as_ref().err())
                .await;
            finalizer_engine.events().emit(WorkerEvent::WorkerStopped {
                worker_id: finalizer_id.clone(),
                error: outcome.clone().err(),
            });
            match &outcome {
                Ok(()) => debug!(worker_id = %finalizer_id, "Stopped"),
                Err(e) => error!(worker_id = %finalizer_id, error = %e, "Stopped with error"),
            }
            done_tx.send_replace(Some(outcome));
        });

        engine.events().emit(WorkerEvent::WorkerCreated {
            worker_id: worker_id.clone(),
            tasks: identifiers,
        });
        debug!(worker_id = %worker_id, "Spawned");

        let worker = Self { inner };
        if params.autostart {
            worker.launch();
        }
        worker
    }

    fn launch(&self) {
        let inner = Arc::clone(&self.inner);
        let span = telemetry::worker_span(&inner.worker_id);
        tokio::spawn(inner.run().instrument(span));
    }

    /// Start a worker spawned without `autostart`
    pub fn start(&self) -> Result<(), WorkerError> {
        {
            let mut control = self.inner.control.lock();
            if control.started {
                return Err(WorkerError::AlreadyStarted);
            }
            if !control.active {
                return Err(WorkerError::Released);
            }
            control.started = true;
            control.state = WorkerState::AwaitingClaim;
        }
        self.launch();
        Ok(())
    }

    /// Worker id
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Current state
    pub fn state(&self) -> WorkerState {
        self.inner.control.lock().state
    }

    /// Whether the worker still accepts new cycles
    pub fn is_active(&self) -> bool {
        self.inner.control.lock().active
    }

    /// Job currently executing, if any
    pub fn active_job(&self) -> Option<Arc<Job>> {
        self.inner.control.lock().active_job.clone()
    }

    /// Consecutive failed claims since the last successful one
    pub fn contiguous_errors(&self) -> u32 {
        self.inner.control.lock().contiguous_errors
    }

    /// Hint that new work may exist
    ///
    /// Returns `true` when the worker was waiting on its poll timer and will
    /// now claim immediately. Otherwise the next wait after an empty claim
    /// is skipped once, and `false` is returned so the caller can nudge
    /// someone else.
    pub fn nudge(&self) -> bool {
        let mut control = self.inner.control.lock();
        if !control.active {
            drop(control);
            debug!(worker_id = %self.inner.worker_id, "Ignoring nudge: worker released");
            return false;
        }

        if control.waiting {
            control.waiting = false;
            drop(control);
            self.inner.wake.notify_waiters();
            true
        } else {
            control.again = true;
            false
        }
    }

    /// Stop scheduling cycles
    ///
    /// Idempotent. Resolves immediately if nothing is in flight; otherwise
    /// once the in-flight claim or job finishes, or right away with `force`
    /// (the in-flight work is not aborted).
    pub fn release(&self, force: bool) -> impl Future<Output = WorkerOutcome> + Send + 'static {
        self.inner.release(force);
        let worker = self.clone();
        async move { worker.wait().await }
    }

    /// Wait for the termination outcome
    pub async fn wait(&self) -> WorkerOutcome {
        let mut done = self.inner.done.clone();
        let outcome = match done.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(WorkerError::Aborted))
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.inner.worker_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        let mut first = true;
        let outcome = loop {
            let step = self.cycle(first).await;
            first = false;
            match step {
                Step::Continue => {}
                Step::Wait { nudgeable } => {
                    if !self.wait_poll_interval(nudgeable).await {
                        break Ok(());
                    }
                }
                Step::Stop(outcome) => break outcome,
            }
        };

        {
            let mut control = self.control.lock();
            control.active = false;
            control.state = WorkerState::Stopped;
        }
        self.settle(outcome);
    }

    async fn cycle(&self, first: bool) -> Step {
        {
            let mut control = self.control.lock();
            let reentered = control.in_cycle || control.active_job.is_some();
            debug_assert!(!reentered, "worker cycle re-entered");
            if reentered {
                return Step::Stop(Err(WorkerError::Reentrant));
            }
            if !control.active {
                return Step::Stop(Ok(()));
            }
            control.in_cycle = true;
            control.enter(WorkerState::AwaitingClaim);
        }

        let step = self.claim_and_execute(first).await;
        self.control.lock().in_cycle = false;
        step
    }

    async fn claim_and_execute(&self, first: bool) -> Step {
        let claimed = match self.claim(first).await {
            Ok(claimed) => claimed,
            Err(error) => return self.claim_failed(error),
        };
        self.control.lock().contiguous_errors = 0;

        let Some(job) = claimed else {
            return self.claim_empty();
        };

        let job = Arc::new(job);
        {
            let mut control = self.control.lock();
            control.active_job = Some(Arc::clone(&job));
            control.enter(WorkerState::Executing);
        }

        let result = self.invoker.run(job).await;

        let active = {
            let mut control = self.control.lock();
            control.active_job = None;
            control.active
        };

        match result {
            Err(fatal) => {
                self.release(false);
                Step::Stop(Err(fatal))
            }
            Ok(()) if active => Step::Continue,
            Ok(()) => Step::Stop(Ok(())),
        }
    }

    async fn claim(&self, first: bool) -> Result<Option<Job>, ClaimError> {
        let mut flags_to_skip = self
            .engine
            .config()
            .forbidden_flags
            .resolve()
            .await
            .map_err(|e| ClaimError::Flags(e.to_string()))?;

        if first {
            let mut ctx = StartWorkerContext {
                worker_id: self.worker_id.clone(),
                tasks: self.identifiers.clone(),
                flags_to_skip,
            };
            self.engine.hooks().start_worker(&mut ctx).await;
            flags_to_skip = ctx.flags_to_skip;
        }

        self.engine.events().emit(WorkerEvent::ClaimStarted {
            worker_id: self.worker_id.clone(),
        });

        let details = self
            .engine
            .task_details(&self.source, &self.identifiers)
            .await?;

        let job = self
            .source
            .claim(&self.worker_id, &details.task_ids, flags_to_skip.as_deref())
            .await?;
        Ok(job)
    }

    fn claim_failed(&self, error: ClaimError) -> Step {
        self.engine.events().emit(WorkerEvent::ClaimError {
            worker_id: self.worker_id.clone(),
            error: error.clone(),
        });

        if !self.continuous {
            self.release(false);
            return Step::Stop(Err(WorkerError::Claim(error)));
        }

        let (contiguous_errors, active) = {
            let mut control = self.control.lock();
            control.contiguous_errors += 1;
            (control.contiguous_errors, control.active)
        };
        if claim_error_level(contiguous_errors) == Level::WARN {
            warn!(error = %error, contiguous_errors, "Failed to acquire job");
        } else {
            debug!(error = %error, contiguous_errors, "Failed to acquire job");
        }

        if active {
            Step::Wait { nudgeable: false }
        } else {
            Step::Stop(Err(WorkerError::Claim(error)))
        }
    }

    fn claim_empty(&self) -> Step {
        self.engine.events().emit(WorkerEvent::ClaimEmpty {
            worker_id: self.worker_id.clone(),
        });

        if !self.continuous {
            self.release(false);
            return Step::Stop(Ok(()));
        }

        if self.control.lock().active {
            Step::Wait { nudgeable: true }
        } else {
            Step::Stop(Ok(()))
        }
    }

    /// Returns `false` when the worker was released during the wait
    async fn wait_poll_interval(&self, nudgeable: bool) -> bool {
        let woken = self.wake.notified();
        tokio::pin!(woken);
        woken.as_mut().enable();

        {
            let mut control = self.control.lock();
            if !control.active {
                return false;
            }
            // Checked under the same lock that publishes `waiting`, so a
            // nudge either lands here or wakes the timer below
            if nudgeable && std::mem::take(&mut control.again) {
                debug!("Nudged since the last claim; claiming again");
                return true;
            }
            control.waiting = true;
            control.state = WorkerState::WaitingRetryTimer;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.engine.config().poll_interval) => {}
            _ = &mut woken => {}
        }

        let mut control = self.control.lock();
        control.waiting = false;
        control.active
    }

    fn release(&self, force: bool) {
        let (newly_released, settle_now) = {
            let mut control = self.control.lock();
            let newly_released = std::mem::replace(&mut control.active, false);
            let idle = control.waiting || !control.started;
            if newly_released {
                control.state = if control.started {
                    WorkerState::Stopping
                } else {
                    WorkerState::Stopped
                };
            }
            (newly_released, idle || force)
        };

        if newly_released {
            self.engine.events().emit(WorkerEvent::WorkerReleased {
                worker_id: self.worker_id.clone(),
            });
            debug!(worker_id = %self.worker_id, force, "Released");
        }
        if settle_now {
            self.settle(Ok(()));
        }
        self.wake.notify_waiters();
    }

    /// First outcome wins
    fn settle(&self, outcome: WorkerOutcome) {
        if let Some(tx) = self.outcome_tx.lock().take() {
            let _ = tx.send(outcome);
        }
    }
}
