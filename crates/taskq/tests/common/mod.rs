//! Shared fixtures for worker tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use taskq::{
    Engine, EngineBuilder, InMemoryJobSource, Job, JobSource, NewJob, SinkError, StoreError,
    TaskId, WorkerConfig, WorkerEvent,
};

/// In-memory store with switchable failures
#[derive(Default)]
pub struct FaultySource {
    pub inner: InMemoryJobSource,
    claim_failures: AtomicU32,
    fail_bookkeeping: AtomicBool,
    claim_instants: Mutex<Vec<Instant>>,
    completed: Mutex<Vec<Job>>,
    failed: Mutex<Vec<(Job, String, Option<Value>)>>,
}

impl FaultySource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` claims
    pub fn fail_next_claims(&self, n: u32) {
        self.claim_failures.store(n, Ordering::SeqCst);
    }

    /// Make complete and fail return an error
    pub fn break_bookkeeping(&self) {
        self.fail_bookkeeping.store(true, Ordering::SeqCst);
    }

    /// When each claim was issued, on the Tokio clock
    pub fn claim_instants(&self) -> Vec<Instant> {
        self.claim_instants.lock().clone()
    }

    pub fn claim_count(&self) -> usize {
        self.claim_instants.lock().len()
    }

    pub fn completed(&self) -> Vec<Job> {
        self.completed.lock().clone()
    }

    pub fn failed(&self) -> Vec<(Job, String, Option<Value>)> {
        self.failed.lock().clone()
    }

    pub async fn add(&self, identifier: &str, payload: Value) -> Job {
        self.inner
            .add_job(NewJob::new(identifier, payload))
            .await
            .expect("add job")
    }
}

#[async_trait]
impl JobSource for FaultySource {
    async fn register_tasks(
        &self,
        identifiers: &[String],
    ) -> Result<Vec<(TaskId, String)>, StoreError> {
        self.inner.register_tasks(identifiers).await
    }

    async fn claim(
        &self,
        worker_id: &str,
        task_ids: &[TaskId],
        flags_to_skip: Option<&[String]>,
    ) -> Result<Option<Job>, StoreError> {
        self.claim_instants.lock().push(Instant::now());

        let remaining = self.claim_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.claim_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Database("connection refused".to_string()));
        }
        self.inner.claim(worker_id, task_ids, flags_to_skip).await
    }

    async fn complete(&self, worker_id: &str, job: &Job) -> Result<(), StoreError> {
        self.completed.lock().push(job.clone());
        if self.fail_bookkeeping.load(Ordering::SeqCst) {
            return Err(StoreError::Database("connection reset".to_string()));
        }
        self.inner.complete(worker_id, job).await
    }

    async fn fail(
        &self,
        worker_id: &str,
        job: &Job,
        message: &str,
        replacement_payload: Option<Value>,
    ) -> Result<(), StoreError> {
        self.failed
            .lock()
            .push((job.clone(), message.to_string(), replacement_payload.clone()));
        if self.fail_bookkeeping.load(Ordering::SeqCst) {
            return Err(StoreError::Database("connection reset".to_string()));
        }
        self.inner
            .fail(worker_id, job, message, replacement_payload)
            .await
    }

    async fn add_job(&self, job: NewJob) -> Result<Job, StoreError> {
        self.inner.add_job(job).await
    }
}

/// Collects every emitted event
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<WorkerEvent>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<WorkerEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(WorkerEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

/// Engine whose events land in the returned recorder
pub fn recording_engine(config: WorkerConfig) -> (Engine, Recorder) {
    let recorder = Recorder::default();
    let events = Arc::clone(&recorder.events);
    let engine = EngineBuilder::new(config)
        .with_sink(move |event: &WorkerEvent| -> Result<(), SinkError> {
            events.lock().push(event.clone());
            Ok(())
        })
        .compile();
    (engine, recorder)
}

/// Poll `condition` every millisecond of (possibly paused) Tokio time
pub async fn until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
