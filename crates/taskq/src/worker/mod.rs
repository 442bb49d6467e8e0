//! Workers that claim and execute jobs
//!
//! ```text
//! ┌──────────────┐   nudge / shutdown   ┌──────────────────────────┐
//! │  WorkerPool  │ ───────────────────► │ Worker (one per slot)    │
//! └──────────────┘                      │  claim ─► TaskInvoker ─┐ │
//!                                       │    ▲                   │ │
//!                                       │    └── complete/fail ◄─┘ │
//!                                       └──────────────────────────┘
//! ```
//!
//! A worker handles at most one job at a time. Parallelism comes from
//! running several workers against the same store.

mod error;
mod invoker;
mod machine;
mod pool;

pub use error::{ClaimError, WorkerError, WorkerOutcome, WorkerPoolError};
pub use machine::{Worker, WorkerParams, WorkerState};
pub use pool::{run_once, WorkerPool};
