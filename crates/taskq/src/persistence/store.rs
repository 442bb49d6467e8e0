//! JobSource trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of attempts a job gets before it is permanently failed
pub const DEFAULT_MAX_ATTEMPTS: i16 = 25;

/// Error type for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// The job exists but its lock belongs to someone else (or nobody)
    #[error("job {job_id} is not locked by worker {worker_id}")]
    LockNotHeld { job_id: JobId, worker_id: String },

    /// Operation not implemented by this store
    #[error("operation not supported by this store: {0}")]
    Unsupported(&'static str),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Durable job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable numeric id of a task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i32);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job as stored in the queue
///
/// `locked_by` / `locked_at` together form the mutual-exclusion token: a
/// claimed job carries the id of the claiming worker and the claim time.
/// `attempts` is incremented by the claim itself, so a job handed to a
/// worker already counts the attempt in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: Option<String>,
    pub task_id: TaskId,
    pub task_identifier: String,
    pub payload: serde_json::Value,
    /// Lower values run first
    pub priority: i16,
    pub run_at: DateTime<Utc>,
    pub attempts: i16,
    pub max_attempts: i16,
    pub last_error: Option<String>,
    pub key: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether the payload is an ordered sequence (a candidate batch job)
    pub fn is_batch(&self) -> bool {
        self.payload.is_array()
    }

    /// Whether another attempt may follow a failure of the current one
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Whether the job is currently locked by the given worker
    pub fn is_locked_by(&self, worker_id: &str) -> bool {
        self.locked_by.as_deref() == Some(worker_id)
    }
}

/// Definition of a job to be added to the queue
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub identifier: String,
    pub payload: serde_json::Value,
    pub queue_name: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub priority: i16,
    pub max_attempts: i16,
    /// Replaces an existing unlocked job with the same key instead of inserting
    pub key: Option<String>,
    pub flags: Vec<String>,
}

impl NewJob {
    /// Create a job definition with default scheduling
    pub fn new(identifier: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            identifier: identifier.into(),
            payload,
            queue_name: None,
            run_at: None,
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            key: None,
            flags: vec![],
        }
    }

    /// Serialise jobs of the same queue (one at a time)
    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    /// Set the earliest time the job may run
    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Set the priority (lower runs first)
    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: i16) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set a deduplication key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a flag that workers may choose to skip
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }
}

/// Fields to overwrite when rescheduling jobs; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RescheduleOptions {
    pub run_at: Option<DateTime<Utc>>,
    pub priority: Option<i16>,
    pub attempts: Option<i16>,
    pub max_attempts: Option<i16>,
}

/// Durable job store consumed by the worker engine
///
/// Implementations must be thread-safe: workers call into the same store
/// concurrently, and the store (not the engine) is the single source of
/// truth for lock ownership.
#[async_trait]
pub trait JobSource: Send + Sync + 'static {
    // =========================================================================
    // Task Identifiers
    // =========================================================================

    /// Upsert the identifiers and return their durable ids
    async fn register_tasks(
        &self,
        identifiers: &[String],
    ) -> Result<Vec<(TaskId, String)>, StoreError>;

    // =========================================================================
    // Worker Operations
    // =========================================================================

    /// Atomically lock and return the next eligible job
    ///
    /// Eligible means: task in `task_ids`, unlocked (or lock expired),
    /// `run_at <= now`, attempts remaining, no flag in `flags_to_skip`, and
    /// its queue (if any) not locked by another job. Claim order is
    /// priority, then run_at, then id. The claim increments `attempts`.
    async fn claim(
        &self,
        worker_id: &str,
        task_ids: &[TaskId],
        flags_to_skip: Option<&[String]>,
    ) -> Result<Option<Job>, StoreError>;

    /// Remove a successfully executed job and release its lock
    async fn complete(&self, worker_id: &str, job: &Job) -> Result<(), StoreError>;

    /// Record a failed attempt, release the lock and reschedule with backoff
    ///
    /// When `replacement_payload` is given it replaces the stored payload.
    async fn fail(
        &self,
        worker_id: &str,
        job: &Job,
        message: &str,
        replacement_payload: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Producer Operations
    // =========================================================================

    /// Add a job to the queue
    async fn add_job(&self, job: NewJob) -> Result<Job, StoreError>;

    // =========================================================================
    // Administration (optional)
    // =========================================================================

    /// Mark unlocked jobs as completed (removes them)
    async fn complete_jobs(&self, _ids: &[JobId]) -> Result<Vec<Job>, StoreError> {
        Err(StoreError::Unsupported("complete_jobs"))
    }

    /// Exhaust the attempts of unlocked jobs so they are never retried
    async fn permanently_fail_jobs(
        &self,
        _ids: &[JobId],
        _reason: &str,
    ) -> Result<Vec<Job>, StoreError> {
        Err(StoreError::Unsupported("permanently_fail_jobs"))
    }

    /// Overwrite scheduling fields of unlocked jobs
    async fn reschedule_jobs(
        &self,
        _ids: &[JobId],
        _options: RescheduleOptions,
    ) -> Result<Vec<Job>, StoreError> {
        Err(StoreError::Unsupported("reschedule_jobs"))
    }

    /// Release every job and queue lock held by the given workers
    async fn force_unlock_workers(&self, _worker_ids: &[String]) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("force_unlock_workers"))
    }

    /// Release locks older than the store's lock timeout
    ///
    /// Returns the number of jobs unlocked.
    async fn reset_locked_at(&self) -> Result<u64, StoreError> {
        Err(StoreError::Unsupported("reset_locked_at"))
    }
}
