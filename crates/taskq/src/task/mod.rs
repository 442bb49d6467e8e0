//! Task definitions and dispatch
//!
//! This module provides:
//! - [`Task`] trait for typed task handlers
//! - [`TaskList`] mapping task identifiers to type-erased handlers
//! - [`TaskOutput`] / [`TaskError`] describing how an attempt ended
//! - [`JobHelpers`] passed to every invocation

mod definition;
mod helpers;
mod list;

pub use definition::{ItemOutcome, Task, TaskError, TaskOutput, TaskResult};
pub use helpers::JobHelpers;
pub use list::{TaskHandler, TaskList, TaskLookupError};
