//! Persistence layer for the job queue
//!
//! This module provides:
//! - [`JobSource`] trait for atomic claim / complete / fail
//! - [`InMemoryJobSource`] for testing
//! - [`PostgresJobSource`] for production, plus [`JobInsertListener`]

mod memory;
mod postgres;
mod store;

pub use memory::{InMemoryJobSource, DEFAULT_LOCK_TIMEOUT};
pub use postgres::{JobInsertListener, PostgresJobSource, DEFAULT_SCHEMA, JOB_INSERT_CHANNEL};
pub use store::{
    Job, JobId, JobSource, NewJob, RescheduleOptions, StoreError, TaskId, DEFAULT_MAX_ATTEMPTS,
};
