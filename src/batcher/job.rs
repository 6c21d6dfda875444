//! Deferred jobs and their retry bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::backoff::BackoffPolicy;

/// Identifier handed back by `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-job settings for `enqueue`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Overrides the batcher's default attempt budget
    pub max_attempts: Option<u32>,
    /// Wait before the first attempt
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A job waiting in the queue or currently executing.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub payload: serde_json::Value,
    /// Failed attempts so far
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_run_at: Instant,
    pub backoff: Duration,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        name: String,
        payload: serde_json::Value,
        max_attempts: u32,
        initial_backoff: Duration,
        run_at: Instant,
    ) -> Self {
        Self {
            id: JobId::new(),
            name,
            payload,
            attempts: 0,
            max_attempts,
            next_run_at: run_at,
            backoff: initial_backoff,
            enqueued_at: Utc::now(),
        }
    }

    /// Record a failed attempt at `now`.
    ///
    /// Returns `true` and reschedules the job if it has attempts left, `false`
    /// once the budget is spent.
    pub fn record_failure(&mut self, policy: &BackoffPolicy, now: Instant) -> bool {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return false;
        }
        self.backoff = policy.next(self.backoff);
        self.next_run_at = now + self.backoff;
        true
    }

    /// Snapshot handed to the handler.
    pub fn context(&self) -> JobContext {
        JobContext {
            id: self.id,
            name: self.name.clone(),
            attempt: self.attempts + 1,
            max_attempts: self.max_attempts,
            payload: self.payload.clone(),
            enqueued_at: self.enqueued_at,
        }
    }
}

/// What a handler sees of the job it runs.
#[derive(Debug, Clone, Serialize)]
pub struct JobContext {
    pub id: JobId,
    pub name: String,
    /// 1-based number of this attempt
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}
