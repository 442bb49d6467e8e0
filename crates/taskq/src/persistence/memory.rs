//! In-memory implementation of JobSource for testing

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::store::*;
use crate::reliability::BackoffPolicy;

/// Locks older than this are considered abandoned
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// Lock held on a named queue while one of its jobs runs
#[derive(Debug, Default)]
struct QueueLock {
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
}

impl QueueLock {
    fn is_available(&self, expired_before: DateTime<Utc>) -> bool {
        self.locked_at.map_or(true, |at| at < expired_before)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tasks: HashMap<String, TaskId>,
    jobs: BTreeMap<JobId, Job>,
    queues: HashMap<String, QueueLock>,
    next_task_id: i32,
    next_job_id: i64,
}

impl MemoryState {
    fn task_id(&mut self, identifier: &str) -> TaskId {
        if let Some(id) = self.tasks.get(identifier) {
            return *id;
        }
        self.next_task_id += 1;
        let id = TaskId(self.next_task_id);
        self.tasks.insert(identifier.to_string(), id);
        id
    }

    fn unlock_queue(&mut self, job: &Job, worker_id: &str) {
        if let Some(queue_name) = &job.queue_name {
            if let Some(lock) = self.queues.get_mut(queue_name) {
                if lock.locked_by.as_deref() == Some(worker_id) {
                    lock.locked_by = None;
                    lock.locked_at = None;
                }
            }
        }
    }

    /// Take a job out of the worker's hands, checking the lock token
    fn locked_job_mut(&mut self, worker_id: &str, id: JobId) -> Result<&mut Job, StoreError> {
        let job = self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if !job.is_locked_by(worker_id) {
            return Err(StoreError::LockNotHeld {
                job_id: id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(job)
    }
}

/// In-memory implementation of JobSource
///
/// This is primarily for testing. It keeps all state behind a single lock
/// so every operation is atomic, and provides the same claim semantics as
/// the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use taskq::InMemoryJobSource;
///
/// let store = InMemoryJobSource::new();
/// assert_eq!(store.job_count(), 0);
/// ```
pub struct InMemoryJobSource {
    state: RwLock<MemoryState>,
    backoff: BackoffPolicy,
    lock_timeout: Duration,
    register_calls: AtomicU64,
    claim_calls: AtomicU64,
}

impl InMemoryJobSource {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            backoff: BackoffPolicy::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            register_calls: AtomicU64::new(0),
            claim_calls: AtomicU64::new(0),
        }
    }

    /// Set the backoff policy applied by `fail`
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the age after which locks are considered abandoned
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Get a snapshot of a job
    pub fn get_job(&self, id: JobId) -> Option<Job> {
        self.state.read().jobs.get(&id).cloned()
    }

    /// Get a snapshot of every job, ordered by id
    pub fn jobs(&self) -> Vec<Job> {
        self.state.read().jobs.values().cloned().collect()
    }

    /// Get the number of jobs still in the store
    pub fn job_count(&self) -> usize {
        self.state.read().jobs.len()
    }

    /// Get the number of jobs currently locked
    pub fn locked_job_count(&self) -> usize {
        self.state
            .read()
            .jobs
            .values()
            .filter(|j| j.locked_by.is_some())
            .count()
    }

    /// Number of `register_tasks` round trips served
    pub fn register_calls(&self) -> u64 {
        self.register_calls.load(Ordering::SeqCst)
    }

    /// Number of `claim` calls served
    pub fn claim_calls(&self) -> u64 {
        self.claim_calls.load(Ordering::SeqCst)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.jobs.clear();
        state.queues.clear();
    }

    fn expired_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.lock_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl Default for InMemoryJobSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobSource for InMemoryJobSource {
    async fn register_tasks(
        &self,
        identifiers: &[String],
    ) -> Result<Vec<(TaskId, String)>, StoreError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write();
        Ok(identifiers
            .iter()
            .map(|identifier| (state.task_id(identifier), identifier.clone()))
            .collect())
    }

    async fn claim(
        &self,
        worker_id: &str,
        task_ids: &[TaskId],
        flags_to_skip: Option<&[String]>,
    ) -> Result<Option<Job>, StoreError> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let expired_before = self.expired_before(now);

        let mut guard = self.state.write();
        let state = &mut *guard;

        let candidate = state
            .jobs
            .values()
            .filter(|j| task_ids.contains(&j.task_id))
            .filter(|j| j.locked_at.map_or(true, |at| at < expired_before))
            .filter(|j| j.run_at <= now)
            .filter(|j| j.has_attempts_remaining())
            .filter(|j| {
                flags_to_skip.map_or(true, |skip| !j.flags.iter().any(|f| skip.contains(f)))
            })
            .filter(|j| {
                j.queue_name.as_ref().map_or(true, |q| {
                    state
                        .queues
                        .get(q)
                        .map_or(true, |lock| lock.is_available(expired_before))
                })
            })
            .min_by_key(|j| (j.priority, j.run_at, j.id))
            .map(|j| j.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.attempts += 1;
        job.locked_by = Some(worker_id.to_string());
        job.locked_at = Some(now);
        job.updated_at = now;
        let claimed = job.clone();

        if let Some(queue_name) = &claimed.queue_name {
            let lock = state.queues.entry(queue_name.clone()).or_default();
            lock.locked_by = Some(worker_id.to_string());
            lock.locked_at = Some(now);
        }

        Ok(Some(claimed))
    }

    async fn complete(&self, worker_id: &str, job: &Job) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state.locked_job_mut(worker_id, job.id)?;
        if let Some(removed) = state.jobs.remove(&job.id) {
            state.unlock_queue(&removed, worker_id);
        }
        Ok(())
    }

    async fn fail(
        &self,
        worker_id: &str,
        job: &Job,
        message: &str,
        replacement_payload: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut state = self.state.write();
        let stored = state.locked_job_mut(worker_id, job.id)?;

        let base = stored.run_at.max(now);
        stored.run_at = chrono::Duration::from_std(self.backoff.delay_for_attempt(stored.attempts))
            .ok()
            .and_then(|delay| base.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        stored.last_error = Some(message.to_string());
        stored.locked_by = None;
        stored.locked_at = None;
        stored.updated_at = now;
        if let Some(payload) = replacement_payload {
            stored.payload = payload;
        }

        let snapshot = stored.clone();
        state.unlock_queue(&snapshot, worker_id);
        Ok(())
    }

    async fn add_job(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut state = self.state.write();
        let task_id = state.task_id(&new_job.identifier);

        if let Some(queue_name) = &new_job.queue_name {
            state.queues.entry(queue_name.clone()).or_default();
        }

        if let Some(key) = &new_job.key {
            let existing = state
                .jobs
                .values_mut()
                .find(|j| j.key.as_deref() == Some(key.as_str()));
            if let Some(existing) = existing {
                if existing.locked_at.is_none() {
                    existing.queue_name = new_job.queue_name.clone();
                    existing.task_id = task_id;
                    existing.task_identifier = new_job.identifier.clone();
                    existing.payload = new_job.payload.clone();
                    existing.priority = new_job.priority;
                    existing.run_at = new_job.run_at.unwrap_or(now);
                    existing.max_attempts = new_job.max_attempts;
                    existing.flags = new_job.flags.clone();
                    existing.attempts = 0;
                    existing.last_error = None;
                    existing.updated_at = now;
                    return Ok(existing.clone());
                }
                // The running job keeps going; the key moves to the new job
                existing.key = None;
            }
        }

        state.next_job_id += 1;
        let job = Job {
            id: JobId(state.next_job_id),
            queue_name: new_job.queue_name,
            task_id,
            task_identifier: new_job.identifier,
            payload: new_job.payload,
            priority: new_job.priority,
            run_at: new_job.run_at.unwrap_or(now),
            attempts: 0,
            max_attempts: new_job.max_attempts,
            last_error: None,
            key: new_job.key,
            flags: new_job.flags,
            locked_at: None,
            locked_by: None,
            created_at: now,
            updated_at: now,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn complete_jobs(&self, ids: &[JobId]) -> Result<Vec<Job>, StoreError> {
        let mut state = self.state.write();
        let mut removed = Vec::new();
        for id in ids {
            let unlocked = state.jobs.get(id).is_some_and(|j| j.locked_at.is_none());
            if unlocked {
                removed.extend(state.jobs.remove(id));
            }
        }
        Ok(removed)
    }

    async fn permanently_fail_jobs(
        &self,
        ids: &[JobId],
        reason: &str,
    ) -> Result<Vec<Job>, StoreError> {
        let now = Utc::now();
        let mut state = self.state.write();
        let mut failed = Vec::new();
        for id in ids {
            if let Some(job) = state.jobs.get_mut(id) {
                if job.locked_at.is_none() {
                    job.attempts = job.max_attempts;
                    job.last_error = Some(reason.to_string());
                    job.updated_at = now;
                    failed.push(job.clone());
                }
            }
        }
        Ok(failed)
    }

    async fn reschedule_jobs(
        &self,
        ids: &[JobId],
        options: RescheduleOptions,
    ) -> Result<Vec<Job>, StoreError> {
        let now = Utc::now();
        let mut state = self.state.write();
        let mut rescheduled = Vec::new();
        for id in ids {
            if let Some(job) = state.jobs.get_mut(id) {
                if job.locked_at.is_none() {
                    if let Some(run_at) = options.run_at {
                        job.run_at = run_at;
                    }
                    if let Some(priority) = options.priority {
                        job.priority = priority;
                    }
                    if let Some(attempts) = options.attempts {
                        job.attempts = attempts;
                    }
                    if let Some(max_attempts) = options.max_attempts {
                        job.max_attempts = max_attempts;
                    }
                    job.updated_at = now;
                    rescheduled.push(job.clone());
                }
            }
        }
        Ok(rescheduled)
    }

    async fn force_unlock_workers(&self, worker_ids: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let held_by = |locked_by: &Option<String>| {
            locked_by
                .as_ref()
                .is_some_and(|owner| worker_ids.contains(owner))
        };
        for job in state.jobs.values_mut().filter(|j| held_by(&j.locked_by)) {
            job.locked_by = None;
            job.locked_at = None;
        }
        for lock in state.queues.values_mut().filter(|q| held_by(&q.locked_by)) {
            lock.locked_by = None;
            lock.locked_at = None;
        }
        Ok(())
    }

    async fn reset_locked_at(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let expired_before = self.expired_before(now);
        let mut state = self.state.write();

        let mut unlocked = 0;
        for job in state.jobs.values_mut() {
            if job.locked_at.is_some_and(|at| at < expired_before) {
                job.locked_at = None;
                job.locked_by = None;
                job.run_at = job.run_at.max(now);
                unlocked += 1;
            }
        }
        for lock in state.queues.values_mut() {
            if lock.locked_at.is_some_and(|at| at < expired_before) {
                lock.locked_at = None;
                lock.locked_by = None;
            }
        }
        Ok(unlocked)
    }
}
