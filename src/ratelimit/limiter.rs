//! Core rate limiter implementation.

use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitingConfig;
use crate::error::Result;

use super::bucket::TokenBucket;
use super::decision::Decision;
use super::key::{BucketKey, IdentityResolver, RequestContext, UserIdResolver};
use super::policy::{Policy, PolicyOverride, PolicyResolver};
use super::whitelist::Whitelist;

/// Outcome of running a request through the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The path is whitelisted; no bucket was touched
    Bypassed,
    /// A bucket was consulted
    Limited(Decision),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        match self {
            Admission::Bypassed => true,
            Admission::Limited(decision) => decision.allowed,
        }
    }

    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Admission::Bypassed => None,
            Admission::Limited(decision) => Some(decision),
        }
    }

    /// Response headers; empty for whitelisted requests.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        self.decision().map(Decision::headers).unwrap_or_default()
    }
}

/// Token bucket rate limiter keyed by request identity and route.
///
/// This struct is thread-safe and can be shared across multiple tasks. Each
/// bucket update holds the map shard lock for its key, so concurrent requests
/// on one key never overdraw it.
pub struct RateLimiter {
    /// Bucket state indexed by rendered bucket key
    buckets: DashMap<String, TokenBucket>,
    policies: PolicyResolver,
    whitelist: Whitelist,
    identity: IdentityResolver,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter from configuration using the system clock.
    pub fn new(config: &RateLimitingConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock::default()))
    }

    /// Create a rate limiter with an explicit clock.
    pub fn with_clock(config: &RateLimitingConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let policies = PolicyResolver::new(config.default_policy.clone(), config.roles.clone())?;
        let whitelist = Whitelist::compile(&config.whitelist)?;
        Ok(Self {
            buckets: DashMap::new(),
            policies,
            whitelist,
            identity: IdentityResolver::new(config.trust_proxy),
            clock,
        })
    }

    /// Install a resolver used for the `user` strategy when no user is authenticated.
    pub fn with_user_resolver(mut self, resolver: UserIdResolver) -> Self {
        self.identity = self.identity.with_user_resolver(resolver);
        self
    }

    /// Take `policy.cost` tokens from the bucket under `key`.
    ///
    /// Missing buckets are created full. The bucket is refilled for the time
    /// elapsed since it was last touched before the cost is applied.
    pub fn consume(&self, key: &str, policy: &Policy) -> Decision {
        let now = self.clock.now_millis();

        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| {
            debug!(
                key = %key,
                capacity = policy.burst_capacity,
                refill_rate = policy.refill_rate_per_sec,
                "Creating new token bucket"
            );
            TokenBucket::full(policy, now)
        });

        bucket.refill(policy, now);
        bucket.touch(policy, now);
        let allowed = bucket.try_consume(policy.cost);

        let decision = Decision {
            allowed,
            remaining: bucket.remaining(),
            reset_seconds: bucket.reset_seconds(policy),
            limit: policy.burst_capacity,
        };
        drop(bucket);

        trace!(
            key = %key,
            cost = policy.cost,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Consumed from token bucket"
        );

        if !allowed {
            debug!(
                key = %key,
                reset_seconds = decision.reset_seconds,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// Run a request through whitelist, policy resolution and its bucket.
    pub fn check(&self, ctx: &RequestContext, route: Option<&PolicyOverride>) -> Admission {
        if self.whitelist.matches(&ctx.path) {
            trace!(path = %ctx.path, "Whitelisted path, skipping rate limit");
            return Admission::Bypassed;
        }

        let policy = self.policies.resolve(ctx.role.as_deref(), route);
        let identity = self.identity.identity(policy.key_strategy, ctx);
        let key = BucketKey::new(&policy, identity, ctx);

        Admission::Limited(self.consume(&key.to_string_key(), &policy))
    }

    /// Bind a validated route override to this limiter.
    pub fn route(self: &Arc<Self>, policy: PolicyOverride) -> Result<RouteGuard> {
        policy.validate()?;
        Ok(RouteGuard {
            limiter: Arc::clone(self),
            policy,
        })
    }

    /// Remove every bucket idle past its expiry. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            let keep = !bucket.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Sweep expired buckets every `interval` until the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        info!(interval_secs = interval.as_secs(), "Starting bucket sweeper");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    debug!("Rate limiter dropped, stopping bucket sweeper");
                    break;
                };
                let removed = limiter.sweep_expired();
                if removed > 0 {
                    debug!(
                        removed = removed,
                        remaining = limiter.bucket_count(),
                        "Swept idle buckets"
                    );
                }
            }
        })
    }

    /// Tokens currently held under `key`, without refilling.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|bucket| bucket.tokens())
    }

    pub fn policies(&self) -> &PolicyResolver {
        &self.policies
    }

    /// Clear all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Get the number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// A route-level policy bound to a shared limiter.
#[derive(Clone)]
pub struct RouteGuard {
    limiter: Arc<RateLimiter>,
    policy: PolicyOverride,
}

impl RouteGuard {
    pub fn check(&self, ctx: &RequestContext) -> Admission {
        self.limiter.check(ctx, Some(&self.policy))
    }

    pub fn policy(&self) -> &PolicyOverride {
        &self.policy
    }
}
