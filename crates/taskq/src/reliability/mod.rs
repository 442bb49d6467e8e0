//! Reliability patterns for job execution
//!
//! This module provides:
//! - [`BackoffPolicy`] - Per-attempt delay applied by stores when a job fails

mod backoff;

pub use backoff::BackoffPolicy;
