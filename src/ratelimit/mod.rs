//! Rate limiting logic and state management.

mod bucket;
mod decision;
mod key;
mod limiter;
mod policy;
mod whitelist;

pub use bucket::TokenBucket;
pub use decision::{
    Decision, RejectionBody, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
    TOO_MANY_REQUESTS,
};
pub use key::{BucketKey, IdentityResolver, RequestContext, UserIdResolver};
pub use limiter::{Admission, RateLimiter, RouteGuard};
pub use policy::{KeyStrategy, Policy, PolicyOverride, PolicyResolver};
pub use whitelist::{Whitelist, WhitelistRule};
