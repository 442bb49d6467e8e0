//! Worker configuration
//!
//! Values are resolved by the embedding application (or [`WorkerConfig::from_env`])
//! and compiled into an [`Engine`](crate::Engine) before any worker starts.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

type SyncFlagsFn = dyn Fn() -> anyhow::Result<Vec<String>> + Send + Sync;
type AsyncFlagsFn = dyn Fn() -> BoxFuture<'static, anyhow::Result<Vec<String>>> + Send + Sync;

/// Source of the flags a worker refuses to claim
///
/// Resolved once per claim, so functions may change their answer over time
/// (for example to back off from jobs hitting a rate-limited API).
#[derive(Clone, Default)]
pub enum ForbiddenFlags {
    /// Claim jobs regardless of their flags
    #[default]
    None,
    /// A fixed set of flags
    Static(Vec<String>),
    /// Computed synchronously before each claim
    Sync(Arc<SyncFlagsFn>),
    /// Computed asynchronously before each claim
    Async(Arc<AsyncFlagsFn>),
}

impl ForbiddenFlags {
    /// Compute the flags with a synchronous function
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<Vec<String>> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    /// Compute the flags with an asynchronous function
    pub fn from_async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<String>>> + Send + 'static,
    {
        Self::Async(Arc::new(move || f().boxed()))
    }

    /// Current flags to skip, or `None` when nothing is forbidden
    pub async fn resolve(&self) -> anyhow::Result<Option<Vec<String>>> {
        let flags = match self {
            Self::None => return Ok(None),
            Self::Static(flags) => flags.clone(),
            Self::Sync(f) => f()?,
            Self::Async(f) => f().await?,
        };
        Ok(Some(flags))
    }
}

impl fmt::Debug for ForbiddenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Static(flags) => f.debug_tuple("Static").field(flags).finish(),
            Self::Sync(_) => write!(f, "Sync(<fn>)"),
            Self::Async(_) => write!(f, "Async(<fn>)"),
        }
    }
}

impl From<Vec<String>> for ForbiddenFlags {
    fn from(flags: Vec<String>) -> Self {
        Self::Static(flags)
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Delay between polls when the queue is empty (or claiming failed)
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Number of workers a pool runs
    pub concurrency: usize,

    /// Keep polling after an empty claim; one-shot workers stop instead
    pub continuous: bool,

    /// Start claiming as soon as the worker is spawned
    pub autostart: bool,

    /// Delay between a graceful shutdown request and the cancellation signal
    #[serde(with = "duration_millis")]
    pub grace_period: Duration,

    /// Log every successfully completed job at info level
    pub log_success: bool,

    /// Flags excluding jobs from being claimed
    #[serde(skip)]
    pub forbidden_flags: ForbiddenFlags,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            concurrency: 1,
            continuous: true,
            autostart: true,
            grace_period: Duration::from_millis(5000),
            log_success: true,
            forbidden_flags: ForbiddenFlags::None,
        }
    }
}

impl WorkerConfig {
    /// Create a configuration from environment variables
    ///
    /// Reads `TASKQ_POLL_INTERVAL_MS`, `TASKQ_CONCURRENCY`,
    /// `TASKQ_GRACE_PERIOD_MS` and `TASKQ_NO_LOG_SUCCESS`; anything unset or
    /// unparsable keeps its default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let poll_interval = env_parse::<u64>("TASKQ_POLL_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let concurrency = env_parse::<usize>("TASKQ_CONCURRENCY")
            .map(|c| c.max(1))
            .unwrap_or(defaults.concurrency);

        let grace_period = env_parse::<u64>("TASKQ_GRACE_PERIOD_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.grace_period);

        let log_success = !std::env::var("TASKQ_NO_LOG_SUCCESS")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Self {
            poll_interval,
            concurrency,
            grace_period,
            log_success,
            ..defaults
        }
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the number of workers in a pool
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set continuous (true) or one-shot (false) mode
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Set whether workers start claiming immediately
    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    /// Set the graceful shutdown grace period
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Enable or disable success logging
    pub fn with_log_success(mut self, log_success: bool) -> Self {
        self.log_success = log_success;
        self
    }

    /// Set the forbidden flags source
    pub fn with_forbidden_flags(mut self, flags: impl Into<ForbiddenFlags>) -> Self {
        self.forbidden_flags = flags.into();
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.concurrency, 1);
        assert!(config.continuous);
        assert!(config.autostart);
        assert!(config.log_success);
        assert!(matches!(config.forbidden_flags, ForbiddenFlags::None));
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerConfig::default()
            .with_poll_interval(Duration::from_millis(100))
            .with_concurrency(0)
            .with_continuous(false)
            .with_forbidden_flags(vec!["slow".to_string()]);

        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.concurrency, 1);
        assert!(!config.continuous);
        assert!(matches!(config.forbidden_flags, ForbiddenFlags::Static(ref f) if f == &["slow"]));
    }

    #[test]
    fn test_config_serialization() {
        let config = WorkerConfig::default().with_grace_period(Duration::from_millis(1500));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["grace_period"], 1500);
        assert!(json.get("forbidden_flags").is_none());

        let parsed: WorkerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.grace_period, Duration::from_millis(1500));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: WorkerConfig = serde_json::from_str(r#"{"concurrency": 4}"#).unwrap();
        assert_eq!(parsed.concurrency, 4);
        assert_eq!(parsed.poll_interval, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_resolve_forbidden_flags() {
        assert_eq!(ForbiddenFlags::None.resolve().await.unwrap(), None);

        let flags = ForbiddenFlags::from_fn(|| Ok(vec!["a".to_string()]));
        assert_eq!(flags.resolve().await.unwrap(), Some(vec!["a".to_string()]));

        let flags = ForbiddenFlags::from_async_fn(|| async { Ok(vec!["b".to_string()]) });
        assert_eq!(flags.resolve().await.unwrap(), Some(vec!["b".to_string()]));

        let flags = ForbiddenFlags::from_fn(|| Err(anyhow::anyhow!("flag service down")));
        assert!(flags.resolve().await.is_err());
    }
}
