//! Asynchronous job runtime.
//!
//! ## Design
//!
//! - A job is accepted, registered as `pending`, and its work is handed to
//!   the worker pool; the caller gets the id back immediately
//! - The background task is the only writer of its job record
//! - Operations are retried a bounded number of times with a fixed delay
//! - Accepted mutations are confirmed by polling downstream state until a
//!   deadline
//! - Every failure ends at the job boundary as `failed` + `error`
//!
//! ## Components
//!
//! - `JobRegistry`: lock-guarded map of job records
//! - `WorkerPool`: fixed worker threads, bounded queue, overflow spawn
//! - `RetryExecutor`: attempt loop with per-attempt job logging
//! - `CompletionPoller`: tick loop over OR-ed probes with a deadline
//! - `JobContext`: what a background task gets to report through

pub mod context;
pub mod poller;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod types;

pub use context::{JobContext, JobFailure};
pub use poller::{CompletionPoller, Condition, PollError, PollOutcome, ProbeOutcome};
pub use pool::{PoolStats, Submission, WorkerPool};
pub use registry::{JobError, JobRegistry, JobStats};
pub use retry::{RetryError, RetryExecutor};
pub use types::{JobLogEntry, JobRecord, JobStatus, PollPolicy, RetryPolicy};
