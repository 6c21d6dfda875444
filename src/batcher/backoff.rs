//! Exponential retry backoff with a cap.

use std::time::Duration;

use super::BatcherError;

/// Doubling backoff bounded by `max`.
///
/// ```rust
/// use std::time::Duration;
/// use shopgate::batcher::BackoffPolicy;
///
/// let backoff = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(30)).unwrap();
/// assert_eq!(backoff.next(Duration::from_millis(500)), Duration::from_secs(1));
/// assert_eq!(backoff.next(Duration::from_secs(20)), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Result<Self, BatcherError> {
        if initial.is_zero() {
            return Err(BatcherError::InvalidConfig(
                "initial backoff must be greater than zero".to_string(),
            ));
        }
        if max < initial {
            return Err(BatcherError::InvalidConfig(format!(
                "max backoff ({:?}) must be >= initial backoff ({:?})",
                max, initial
            )));
        }
        Ok(Self { initial, max })
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Backoff to use after a failure at `current`.
    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }

    /// Successive backoff values starting at `initial`.
    pub fn sequence(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.initial), move |current| Some(self.next(*current)))
    }
}
