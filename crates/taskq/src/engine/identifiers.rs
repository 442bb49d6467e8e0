//! Task identifier resolution cache
//!
//! Workers claim jobs by numeric task id, so every poll needs the mapping
//! from the supported task identifiers to their durable ids. The cache keeps
//! one entry per compiled [`Engine`](super::Engine), keyed by its
//! [`EngineHandle`], and deduplicates concurrent resolutions: all callers
//! asking for the same identifier set share a single store round trip.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::debug;

use crate::persistence::{JobSource, StoreError, TaskId};

static NEXT_ENGINE_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a compiled engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(u64);

impl EngineHandle {
    /// Issue a handle that has never been issued before
    pub(crate) fn next() -> Self {
        Self(NEXT_ENGINE_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for logging
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

/// Resolved identifiers for the supported task set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskDetails {
    pub supported_task_identifier_by_task_id: HashMap<TaskId, String>,
    pub task_ids: Vec<TaskId>,
}

impl TaskDetails {
    fn from_rows(rows: Vec<(TaskId, String)>) -> Self {
        let mut task_ids: Vec<TaskId> = rows.iter().map(|(id, _)| *id).collect();
        task_ids.sort();
        Self {
            supported_task_identifier_by_task_id: rows.into_iter().collect(),
            task_ids,
        }
    }

    /// Identifier registered under a task id
    pub fn identifier(&self, task_id: TaskId) -> Option<&str> {
        self.supported_task_identifier_by_task_id
            .get(&task_id)
            .map(String::as_str)
    }
}

/// Error from identifier resolution
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentifierError {
    /// The worker has nothing it could run
    #[error("no runnable tasks: the supported task identifier set is empty")]
    NoRunnableTasks,

    /// The upsert-then-select round trip failed
    #[error("failed to resolve task identifiers: {0}")]
    Store(#[from] StoreError),
}

type Resolution = Shared<BoxFuture<'static, Result<Arc<TaskDetails>, IdentifierError>>>;

#[derive(Default)]
enum CacheSlot {
    #[default]
    Empty,
    Resolving {
        signature: String,
        generation: u64,
        resolution: Resolution,
    },
    Resolved {
        signature: String,
        details: Arc<TaskDetails>,
    },
}

/// Registry of resolved task identifiers, one entry per engine handle
#[derive(Default)]
pub struct TaskIdentifierCache {
    entries: DashMap<EngineHandle, Arc<Mutex<CacheSlot>>>,
    generation: AtomicU64,
}

impl TaskIdentifierCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve identifiers to task ids, hitting the store only when needed
    ///
    /// Returns the cached mapping when `identifiers` matches the last
    /// resolved set for `handle`, joins an in-flight resolution of the same
    /// set, and otherwise starts exactly one new round trip. A failed round
    /// trip leaves the entry empty so the next call retries.
    pub async fn resolve(
        &self,
        handle: EngineHandle,
        source: &Arc<dyn JobSource>,
        identifiers: &[String],
    ) -> Result<Arc<TaskDetails>, IdentifierError> {
        if identifiers.is_empty() {
            return Err(IdentifierError::NoRunnableTasks);
        }

        let mut names = identifiers.to_vec();
        names.sort();
        names.dedup();
        let signature = serde_json::Value::from(names.clone()).to_string();

        let slot = Arc::clone(self.entries.entry(handle).or_default().value());

        let (resolution, generation) = {
            let mut guard = slot.lock();
            match &*guard {
                CacheSlot::Resolved {
                    signature: cached,
                    details,
                } if *cached == signature => return Ok(Arc::clone(details)),
                CacheSlot::Resolving {
                    signature: pending,
                    generation,
                    resolution,
                } if *pending == signature => (resolution.clone(), *generation),
                _ => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let source = Arc::clone(source);
                    debug!(%handle, %signature, "resolving task identifiers");

                    let resolution = async move {
                        let rows = source.register_tasks(&names).await?;
                        Ok::<_, IdentifierError>(Arc::new(TaskDetails::from_rows(rows)))
                    }
                    .boxed()
                    .shared();

                    *guard = CacheSlot::Resolving {
                        signature: signature.clone(),
                        generation,
                        resolution: resolution.clone(),
                    };
                    (resolution, generation)
                }
            }
        };

        let result = resolution.await;

        let mut guard = slot.lock();
        let settles = matches!(&*guard, CacheSlot::Resolving { generation: g, .. } if *g == generation);
        if settles {
            *guard = match &result {
                Ok(details) => CacheSlot::Resolved {
                    signature,
                    details: Arc::clone(details),
                },
                Err(_) => CacheSlot::Empty,
            };
        }

        result
    }

    /// Drop the entry of an engine that no longer exists
    pub fn discard(&self, handle: EngineHandle) {
        if self.entries.remove(&handle).is_some() {
            debug!(%handle, "discarded task identifier cache entry");
        }
    }

    /// Check whether an engine has an entry
    pub fn contains(&self, handle: EngineHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Number of engine entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::persistence::{InMemoryJobSource, Job, NewJob};

    /// Delays identifier resolution and can fail the first round trip
    struct SlowSource {
        inner: InMemoryJobSource,
        fail_next: AtomicBool,
    }

    impl SlowSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: InMemoryJobSource::new(),
                fail_next: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl JobSource for SlowSource {
        async fn register_tasks(
            &self,
            identifiers: &[String],
        ) -> Result<Vec<(TaskId, String)>, StoreError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let rows = self.inner.register_tasks(identifiers).await?;
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Database("connection reset".to_string()));
            }
            Ok(rows)
        }

        async fn claim(
            &self,
            worker_id: &str,
            task_ids: &[TaskId],
            flags_to_skip: Option<&[String]>,
        ) -> Result<Option<Job>, StoreError> {
            self.inner.claim(worker_id, task_ids, flags_to_skip).await
        }

        async fn complete(&self, worker_id: &str, job: &Job) -> Result<(), StoreError> {
            self.inner.complete(worker_id, job).await
        }

        async fn fail(
            &self,
            worker_id: &str,
            job: &Job,
            message: &str,
            replacement_payload: Option<serde_json::Value>,
        ) -> Result<(), StoreError> {
            self.inner
                .fail(worker_id, job, message, replacement_payload)
                .await
        }

        async fn add_job(&self, job: NewJob) -> Result<Job, StoreError> {
            self.inner.add_job(job).await
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_resolutions_share_one_round_trip() {
        let slow = SlowSource::new();
        let source: Arc<dyn JobSource> = slow.clone();
        let cache = TaskIdentifierCache::new();
        let handle = EngineHandle::next();

        let a = names(&["send_email", "resize_image"]);
        let b = names(&["resize_image", "send_email"]);
        let (first, second) = tokio::join!(
            cache.resolve(handle, &source, &a),
            cache.resolve(handle, &source, &b),
        );

        assert_eq!(slow.inner.register_calls(), 1);
        assert_eq!(first.unwrap(), second.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_until_signature_changes() {
        let slow = SlowSource::new();
        let source: Arc<dyn JobSource> = slow.clone();
        let cache = TaskIdentifierCache::new();
        let handle = EngineHandle::next();

        let details = cache
            .resolve(handle, &source, &names(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(details.task_ids.len(), 2);
        cache
            .resolve(handle, &source, &names(&["b", "a", "a"]))
            .await
            .unwrap();
        assert_eq!(slow.inner.register_calls(), 1);

        let details = cache
            .resolve(handle, &source, &names(&["a", "b", "c"]))
            .await
            .unwrap();
        assert_eq!(slow.inner.register_calls(), 2);
        assert_eq!(details.task_ids.len(), 3);
        assert!(details
            .task_ids
            .iter()
            .any(|id| details.identifier(*id) == Some("c")));
    }

    #[tokio::test]
    async fn test_empty_set_fails_without_store_access() {
        let slow = SlowSource::new();
        let source: Arc<dyn JobSource> = slow.clone();
        let cache = TaskIdentifierCache::new();

        let err = cache
            .resolve(EngineHandle::next(), &source, &[])
            .await
            .unwrap_err();

        assert!(matches!(err, IdentifierError::NoRunnableTasks));
        assert_eq!(slow.inner.register_calls(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_resolution_is_retried() {
        let slow = SlowSource::new();
        slow.fail_next.store(true, Ordering::SeqCst);
        let source: Arc<dyn JobSource> = slow.clone();
        let cache = TaskIdentifierCache::new();
        let handle = EngineHandle::next();
        let tasks = names(&["a"]);

        let err = cache.resolve(handle, &source, &tasks).await.unwrap_err();
        assert!(matches!(err, IdentifierError::Store(_)));

        cache.resolve(handle, &source, &tasks).await.unwrap();
        cache.resolve(handle, &source, &tasks).await.unwrap();
        assert_eq!(slow.inner.register_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_are_per_handle_and_discardable() {
        let slow = SlowSource::new();
        let source: Arc<dyn JobSource> = slow.clone();
        let cache = TaskIdentifierCache::new();
        let (one, two) = (EngineHandle::next(), EngineHandle::next());
        let tasks = names(&["a"]);

        cache.resolve(one, &source, &tasks).await.unwrap();
        cache.resolve(two, &source, &tasks).await.unwrap();
        assert_eq!(slow.inner.register_calls(), 2);
        assert_eq!(cache.len(), 2);

        cache.discard(one);
        assert!(!cache.contains(one));
        assert!(cache.contains(two));
    }

    #[test]
    fn test_handles_are_unique() {
        let a = EngineHandle::next();
        let b = EngineHandle::next();
        assert_ne!(a, b);
        assert!(b.to_string().starts_with("engine-"));
    }
}
