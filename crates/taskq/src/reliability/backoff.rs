//! Backoff policy for failed job attempts

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponent cap of the default policy (`e^10` seconds is roughly 6 hours)
const DEFAULT_MAX_EXPONENT: u32 = 10;

/// How long a failed job waits before it becomes eligible again
///
/// The delay after attempt `n` is
/// `initial_interval * backoff_coefficient ^ min(n, max_exponent)`,
/// capped at `max_interval` and optionally jittered.
///
/// # Example
///
/// ```
/// use taskq::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::exponential()
///     .with_initial_interval(Duration::from_secs(1))
///     .with_backoff_coefficient(2.0)
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay multiplied by the coefficient power
    #[serde(with = "crate::config::duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between attempts
    #[serde(with = "crate::config::duration_millis")]
    pub max_interval: Duration,

    /// Growth factor per attempt
    pub backoff_coefficient: f64,

    /// Attempts beyond this no longer grow the delay
    pub max_exponent: u32,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl BackoffPolicy {
    /// `exp(min(attempts, 10))` seconds, no jitter
    pub fn exponential() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60 * 60 * 24),
            backoff_coefficient: std::f64::consts::E,
            max_exponent: DEFAULT_MAX_EXPONENT,
            jitter: 0.0,
        }
    }

    /// Retry after the same delay every time
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            max_exponent: 0,
            jitter: 0.0,
        }
    }

    /// Set the base interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the exponent cap
    pub fn with_max_exponent(mut self, max_exponent: u32) -> Self {
        self.max_exponent = max_exponent;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to apply after the given (post-increment) attempt count
    pub fn delay_for_attempt(&self, attempts: i16) -> Duration {
        let exponent = (attempts.max(0) as u32).min(self.max_exponent);
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent as i32);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = BackoffPolicy::exponential();

        // e^1, e^2 seconds
        let first = policy.delay_for_attempt(1).as_secs_f64();
        let second = policy.delay_for_attempt(2).as_secs_f64();
        assert!((first - std::f64::consts::E).abs() < 1e-6);
        assert!((second - std::f64::consts::E.powi(2)).abs() < 1e-6);
    }

    #[test]
    fn test_exponent_cap() {
        let policy = BackoffPolicy::exponential();
        assert_eq!(policy.delay_for_attempt(10), policy.delay_for_attempt(25));
    }

    #[test]
    fn test_fixed_interval() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(5));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(5));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = BackoffPolicy::exponential()
            .with_backoff_coefficient(2.0)
            .with_max_interval(Duration::from_secs(5));

        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(10)).with_jitter(0.1);

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1).as_secs_f64();
            assert!((9.0..=11.0).contains(&delay));
        }
    }

    #[test]
    fn test_serialization() {
        let policy = BackoffPolicy::exponential().with_max_exponent(4);

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: BackoffPolicy = serde_json::from_str(&json).unwrap();

        assert_eq!(policy, parsed);
    }
}
