//! Worker error types

use crate::engine::IdentifierError;
use crate::persistence::{JobId, StoreError};

/// Why a claim attempt failed
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClaimError {
    /// Supported task identifiers could not be resolved
    #[error(transparent)]
    Identifiers(#[from] IdentifierError),

    /// The forbidden flags function failed
    #[error("failed to resolve forbidden flags: {0}")]
    Flags(String),

    /// The store's claim operation failed
    #[error("failed to claim job: {0}")]
    Store(#[from] StoreError),
}

/// Why a worker stopped with an error
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    /// Claiming failed in one-shot mode (or after release)
    #[error("worker stopped after claim error: {0}")]
    Claim(ClaimError),

    /// The outcome of an executed job could not be recorded
    #[error("failed to record outcome of job {job_id}: {error}")]
    Bookkeeping {
        job_id: JobId,
        #[source]
        error: StoreError,
    },

    /// A cycle began while a claim or job was still in flight
    #[error("worker cycle re-entered while a claim or job was in flight")]
    Reentrant,

    /// `start` called on a worker that already started
    #[error("worker has already started")]
    AlreadyStarted,

    /// `start` called on a worker that was released
    #[error("worker has been released")]
    Released,

    /// The worker task went away without settling an outcome
    #[error("worker task ended without reporting an outcome")]
    Aborted,
}

/// Error from a pool of workers
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerPoolError {
    /// A worker stopped with an error
    #[error("worker {worker_id} failed: {error}")]
    Worker {
        worker_id: String,
        #[source]
        error: WorkerError,
    },
}

/// Termination outcome shared by every waiter of a worker
pub type WorkerOutcome = Result<(), WorkerError>;
