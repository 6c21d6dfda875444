//! Shopgate - request admission and background work for a storefront backend
//!
//! This crate holds two independent in-memory components. The rate limiter
//! admits or rejects requests with per-identity token buckets, resolving
//! policies from a global default, role overrides and route overrides. The job
//! batcher runs deferred jobs on a bounded worker pool and retries failures with
//! capped exponential backoff.

pub mod batcher;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
