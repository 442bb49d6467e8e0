//! Compiled engine configuration
//!
//! An [`Engine`] bundles everything workers share: the resolved
//! [`WorkerConfig`], event sinks, hooks and the task identifier cache.
//! Compiling issues a fresh [`EngineHandle`]; the identifier cache entry for
//! that handle lives exactly as long as the engine.

mod events;
mod hooks;
mod identifiers;

pub use events::{EventDispatcher, EventSink, SinkError, WorkerEvent};
pub use hooks::{NoopHooks, StartWorkerContext, WorkerHooks};
pub use identifiers::{EngineHandle, IdentifierError, TaskDetails, TaskIdentifierCache};

use std::sync::Arc;

use tracing::debug;

use crate::config::WorkerConfig;
use crate::persistence::JobSource;

struct EngineInner {
    handle: EngineHandle,
    config: WorkerConfig,
    events: EventDispatcher,
    hooks: Arc<dyn WorkerHooks>,
    identifiers: Arc<TaskIdentifierCache>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.identifiers.discard(self.handle);
    }
}

/// Shared, immutable configuration for a set of workers
///
/// Cheap to clone; every clone refers to the same handle.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Compile a configuration with no sinks and no hooks
    pub fn new(config: WorkerConfig) -> Self {
        EngineBuilder::new(config).compile()
    }

    /// Start building an engine
    pub fn builder(config: WorkerConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Identity of this compiled configuration
    pub fn handle(&self) -> EngineHandle {
        self.inner.handle
    }

    /// Worker configuration
    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Event dispatcher shared by all workers
    pub fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    /// Worker hooks
    pub fn hooks(&self) -> &Arc<dyn WorkerHooks> {
        &self.inner.hooks
    }

    /// Identifier cache this engine resolves through
    pub fn identifier_cache(&self) -> &Arc<TaskIdentifierCache> {
        &self.inner.identifiers
    }

    /// Resolve the supported identifiers to task ids through the cache
    pub async fn task_details(
        &self,
        source: &Arc<dyn JobSource>,
        identifiers: &[String],
    ) -> Result<Arc<TaskDetails>, IdentifierError> {
        self.inner
            .identifiers
            .resolve(self.inner.handle, source, identifiers)
            .await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("handle", &self.inner.handle)
            .field("config", &self.inner.config)
            .field("events", &self.inner.events)
            .finish()
    }
}

/// Builder for [`Engine`]
///
/// # Example
///
/// ```
/// use taskq::{EngineBuilder, WorkerConfig, WorkerEvent, SinkError};
/// use std::time::Duration;
///
/// let engine = EngineBuilder::new(WorkerConfig::default().with_poll_interval(Duration::from_millis(500)))
///     .with_sink(|event: &WorkerEvent| -> Result<(), SinkError> {
///         println!("{}", event.name());
///         Ok(())
///     })
///     .compile();
///
/// assert_eq!(engine.config().poll_interval, Duration::from_millis(500));
/// ```
pub struct EngineBuilder {
    config: WorkerConfig,
    events: EventDispatcher,
    hooks: Option<Arc<dyn WorkerHooks>>,
    identifiers: Option<Arc<TaskIdentifierCache>>,
}

impl EngineBuilder {
    /// Create a builder for the given configuration
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            events: EventDispatcher::new(),
            hooks: None,
            identifiers: None,
        }
    }

    /// Add an event sink
    pub fn with_sink(mut self, sink: impl EventSink) -> Self {
        self.events.add_sink(Arc::new(sink));
        self
    }

    /// Set the worker hooks
    pub fn with_hooks(mut self, hooks: impl WorkerHooks) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    /// Share an identifier cache between engines
    pub fn with_identifier_cache(mut self, cache: Arc<TaskIdentifierCache>) -> Self {
        self.identifiers = Some(cache);
        self
    }

    /// Compile the configuration, issuing a new engine handle
    pub fn compile(self) -> Engine {
        let handle = EngineHandle::next();
        debug!(%handle, "compiled engine");

        Engine {
            inner: Arc::new(EngineInner {
                handle,
                config: self.config,
                events: self.events,
                hooks: self.hooks.unwrap_or_else(|| Arc::new(NoopHooks)),
                identifiers: self.identifiers.unwrap_or_default(),
            }),
        }
    }
}
