//! In-process job batcher with retry and exponential backoff.
//!
//! Jobs are queued by run time and dispatched by a single coordinator task to at
//! most `concurrency` concurrently running workers. A failed job is rescheduled
//! with a doubled, capped backoff until its attempt budget runs out, then dropped.
//! Nothing is persisted: queued jobs are lost when the process exits.

mod backoff;
mod handler;
mod job;
mod queue;
mod scheduler;

use thiserror::Error;

pub use backoff::BackoffPolicy;
pub use handler::{handler_fn, FnHandler, HandlerRegistry, JobHandler, GENERIC_JOB};
pub use job::{EnqueueOptions, Job, JobContext, JobId};
pub use queue::JobQueue;
pub use scheduler::{Batcher, BatcherStats, ShutdownReport};

/// Errors returned by the job batcher.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatcherError {
    #[error("Batcher is shutting down")]
    ShuttingDown,
    #[error("Invalid batcher configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid job: {0}")]
    InvalidJob(String),
}
