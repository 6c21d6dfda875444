//! Token bucket state.

use super::policy::Policy;

/// Mutable state for one rate limit key.
///
/// Refill is lazy: tokens are only topped up when the bucket is touched.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    tokens: f64,
    last_refill_ms: u64,
    expires_at_ms: u64,
}

impl TokenBucket {
    /// Create a bucket filled to the policy's burst capacity.
    pub fn full(policy: &Policy, now_ms: u64) -> Self {
        Self {
            tokens: policy.burst_capacity as f64,
            last_refill_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(policy.idle_expire_millis()),
        }
    }

    /// Add the tokens accrued since the last refill, capped at capacity.
    pub fn refill(&mut self, policy: &Policy, now_ms: u64) {
        let elapsed_secs = now_ms.saturating_sub(self.last_refill_ms) as f64 / 1000.0;
        let capacity = policy.burst_capacity as f64;
        self.tokens = (self.tokens + elapsed_secs * policy.refill_rate_per_sec).min(capacity);
        self.last_refill_ms = self.last_refill_ms.max(now_ms);
    }

    /// Push the idle expiry forward.
    pub fn touch(&mut self, policy: &Policy, now_ms: u64) {
        self.expires_at_ms = now_ms.saturating_add(policy.idle_expire_millis());
    }

    /// Take `cost` tokens if available. Leaves the bucket untouched otherwise.
    pub fn try_consume(&mut self, cost: u32) -> bool {
        let cost = cost as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Whole tokens left.
    pub fn remaining(&self) -> u32 {
        self.tokens.max(0.0).floor() as u32
    }

    /// Seconds until the bucket is full again.
    ///
    /// This is the time to a full refill, not the time until the next request
    /// could pass, so it overstates the wait for a single token.
    pub fn reset_seconds(&self, policy: &Policy) -> u64 {
        let missing = policy.burst_capacity as f64 - self.tokens;
        let secs = (missing / policy.refill_rate_per_sec).ceil();
        if secs > 0.0 {
            secs as u64
        } else {
            0
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at_ms
    }
}
