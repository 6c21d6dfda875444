//! Coordinator task and worker dispatch.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::BatcherConfig;
use crate::error::Result;

use super::backoff::BackoffPolicy;
use super::handler::HandlerRegistry;
use super::job::{EnqueueOptions, Job, JobId};
use super::queue::JobQueue;
use super::BatcherError;

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatcherStats {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub retried: u64,
    pub dropped: u64,
}

/// What was left behind when the batcher stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Jobs still executing when the grace period ended
    pub in_flight: usize,
    /// Jobs still queued; they are discarded with the batcher
    pub abandoned_queued: usize,
}

/// Background job batcher.
///
/// `enqueue` never blocks on job execution. A single coordinator task owns
/// dispatch, so the running count only grows from one place.
pub struct Batcher {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    queue: Mutex<JobQueue>,
    running: AtomicUsize,
    handlers: HandlerRegistry,
    backoff: BackoffPolicy,
    concurrency: usize,
    default_max_attempts: u32,
    poll_interval: Duration,
    busy_poll: Duration,
    shutdown_grace: Duration,
    /// Wakes the coordinator before its timer fires
    wake: Notify,
    /// Signalled each time a running job finishes
    finished: Notify,
    completed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

impl Batcher {
    /// Validate `config` and spawn the coordinator on the current tokio runtime.
    pub fn start(config: &BatcherConfig, handlers: HandlerRegistry) -> Result<Self> {
        config.validate()?;
        let backoff = BackoffPolicy::new(config.initial_backoff(), config.max_backoff())?;

        if !handlers.has_generic() {
            debug!("No generic job handler registered; unmatched jobs will be dropped");
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(JobQueue::new()),
            running: AtomicUsize::new(0),
            handlers,
            backoff,
            concurrency: config.concurrency,
            default_max_attempts: config.default_max_attempts,
            poll_interval: config.poll_interval(),
            busy_poll: config.busy_poll(),
            shutdown_grace: config.shutdown_grace(),
            wake: Notify::new(),
            finished: Notify::new(),
            completed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let coordinator = tokio::spawn(run(Arc::clone(&shared), shutdown_rx));

        info!(
            concurrency = config.concurrency,
            default_max_attempts = config.default_max_attempts,
            initial_backoff_ms = config.initial_backoff_ms,
            max_backoff_ms = config.max_backoff_ms,
            "Job batcher started"
        );

        Ok(Self {
            shared,
            shutdown,
            coordinator: Mutex::new(Some(coordinator)),
        })
    }

    /// Queue a job and return its id immediately.
    pub fn enqueue(
        &self,
        name: impl Into<String>,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> std::result::Result<JobId, BatcherError> {
        let max_attempts = options.max_attempts.unwrap_or(self.shared.default_max_attempts);
        if max_attempts == 0 {
            return Err(BatcherError::InvalidJob(
                "max_attempts must be greater than zero".to_string(),
            ));
        }

        let delay = options.delay.unwrap_or_default();
        let job = Job::new(
            name.into(),
            payload,
            max_attempts,
            self.shared.backoff.initial(),
            Instant::now() + delay,
        );
        let id = job.id;
        let name = job.name.clone();

        {
            // Shutdown sets the flag while holding the queue lock.
            let mut queue = self.shared.queue.lock();
            if *self.shutdown.borrow() {
                return Err(BatcherError::ShuttingDown);
            }
            queue.push(job);
        }

        debug!(
            job_id = %id,
            job = %name,
            max_attempts = max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Job enqueued"
        );

        self.shared.wake.notify_one();
        Ok(id)
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            queued: self.shared.queue.lock().len(),
            running: self.shared.running.load(Ordering::SeqCst),
            completed: self.shared.completed.load(Ordering::Relaxed),
            retried: self.shared.retried.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop scheduling and wait, up to the grace period, for running jobs.
    ///
    /// Running jobs are never cancelled; anything still queued is discarded.
    pub async fn shutdown(&self) -> ShutdownReport {
        {
            let _queue = self.shared.queue.lock();
            self.shutdown.send_replace(true);
        }

        let coordinator = self.coordinator.lock().take();
        if let Some(handle) = coordinator {
            if let Err(e) = handle.await {
                warn!(error = %e, "Job batcher coordinator ended abnormally");
            }
        }

        let deadline = Instant::now() + self.shared.shutdown_grace;
        loop {
            let finished = self.shared.finished.notified();
            if self.shared.running.load(Ordering::SeqCst) == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, finished).await.is_err() {
                break;
            }
        }

        let report = ShutdownReport {
            in_flight: self.shared.running.load(Ordering::SeqCst),
            abandoned_queued: self.shared.queue.lock().len(),
        };

        if report.in_flight > 0 || report.abandoned_queued > 0 {
            warn!(
                in_flight = report.in_flight,
                abandoned_queued = report.abandoned_queued,
                "Job batcher stopped with unfinished work"
            );
        } else {
            info!("Job batcher stopped");
        }

        report
    }
}

async fn run(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        shared.dispatch_ready();
        let delay = shared.next_delay(Instant::now());

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.wake.notified() => {}
            changed = shutdown.changed() => {
                // A dropped sender means the batcher itself is gone.
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Job batcher coordinator stopped");
}

impl Shared {
    /// Start ready jobs until the concurrency limit is reached.
    fn dispatch_ready(self: &Arc<Self>) {
        let now = Instant::now();
        while self.running.load(Ordering::SeqCst) < self.concurrency {
            let Some(job) = self.queue.lock().pop_ready(now) else {
                break;
            };
            self.running.fetch_add(1, Ordering::SeqCst);

            let shared = Arc::clone(self);
            tokio::spawn(async move { shared.execute(job).await });
        }
    }

    /// Tight polling while workers are busy, otherwise sleep until the next due job.
    fn next_delay(&self, now: Instant) -> Duration {
        if self.running.load(Ordering::SeqCst) > 0 {
            return self.busy_poll;
        }
        match self.queue.lock().next_run_at() {
            Some(at) => at.saturating_duration_since(now).min(self.poll_interval),
            None => self.poll_interval,
        }
    }

    async fn execute(&self, mut job: Job) {
        let Some(handler) = self.handlers.resolve(&job.name) else {
            warn!(
                job_id = %job.id,
                job = %job.name,
                "No handler registered for job, dropping"
            );
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.release(None);
            return;
        };

        debug!(
            job_id = %job.id,
            job = %job.name,
            attempt = job.attempts + 1,
            max_attempts = job.max_attempts,
            "Running job"
        );

        let outcome = AssertUnwindSafe(handler.handle(job.context()))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{:#}", err)),
            Err(panic) => Some(panic_message(&*panic)),
        };

        let Some(failure) = failure else {
            debug!(job_id = %job.id, job = %job.name, "Job completed");
            self.completed.fetch_add(1, Ordering::Relaxed);
            self.release(None);
            return;
        };

        if job.record_failure(&self.backoff, Instant::now()) {
            warn!(
                job_id = %job.id,
                job = %job.name,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                retry_in_ms = job.backoff.as_millis() as u64,
                error = %failure,
                "Job failed, scheduling retry"
            );
            self.retried.fetch_add(1, Ordering::Relaxed);
            self.release(Some(job));
        } else {
            error!(
                job_id = %job.id,
                job = %job.name,
                attempts = job.attempts,
                enqueued_at = %job.enqueued_at,
                error = %failure,
                "Job exhausted its attempts, dropping"
            );
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.release(None);
        }
    }

    /// Free a worker slot, requeueing `retry` if given.
    fn release(&self, retry: Option<Job>) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        if let Some(job) = retry {
            self.queue.lock().push(job);
        }
        self.wake.notify_one();
        self.finished.notify_waiters();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", msg)
    } else {
        "handler panicked".to_string()
    }
}
