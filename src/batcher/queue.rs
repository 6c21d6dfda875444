//! Time-ordered job queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::time::Instant;

use super::job::Job;

struct Entry {
    job: Job,
    seq: u64,
}

impl Entry {
    fn sort_key(&self) -> (Instant, u64) {
        (self.job.next_run_at, self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap yields the earliest run time first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.sort_key().cmp(&self.sort_key())
    }
}

/// Jobs not yet started, ordered by `next_run_at`, then insertion order.
#[derive(Default)]
pub struct JobQueue {
    heap: BinaryHeap<Entry>,
    seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: Job) {
        self.seq += 1;
        self.heap.push(Entry { job, seq: self.seq });
    }

    /// Remove and return the earliest job due at or before `now`.
    pub fn pop_ready(&mut self, now: Instant) -> Option<Job> {
        if self.heap.peek()?.job.next_run_at > now {
            return None;
        }
        self.heap.pop().map(|entry| entry.job)
    }

    /// Run time of the earliest queued job.
    pub fn next_run_at(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.job.next_run_at)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn job(name: &str, run_at: Instant) -> Job {
        Job::new(name.to_string(), json!(null), 1, Duration::from_millis(1), run_at)
    }

    #[test]
    fn test_pops_in_run_time_order() {
        let now = Instant::now();
        let mut queue = JobQueue::new();
        queue.push(job("c", now + Duration::from_secs(3)));
        queue.push(job("a", now + Duration::from_secs(1)));
        queue.push(job("b", now + Duration::from_secs(2)));

        let later = now + Duration::from_secs(10);
        let order: Vec<String> = std::iter::from_fn(|| queue.pop_ready(later))
            .map(|j| j.name)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_equal_run_times_are_fifo() {
        let now = Instant::now();
        let mut queue = JobQueue::new();
        for name in ["first", "second", "third"] {
            queue.push(job(name, now));
        }
        let order: Vec<String> = std::iter::from_fn(|| queue.pop_ready(now))
            .map(|j| j.name)
            .collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_future_jobs_are_not_ready() {
        let now = Instant::now();
        let mut queue = JobQueue::new();
        let due = now + Duration::from_millis(500);
        queue.push(job("later", due));

        assert!(queue.pop_ready(now).is_none());
        assert_eq!(queue.next_run_at(), Some(due));
        assert_eq!(queue.len(), 1);
        assert!(queue.pop_ready(due).is_some());
    }
}
