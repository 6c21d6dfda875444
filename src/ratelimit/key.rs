//! Request identity resolution and bucket key generation.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use super::policy::{KeyStrategy, Policy};

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";
const USER_AGENT: &str = "user-agent";
const UNKNOWN_IP: &str = "unknown";

/// Callback that derives a user identity for requests without an authenticated user.
pub type UserIdResolver = Arc<dyn Fn(&RequestContext) -> Option<String> + Send + Sync>;

/// The parts of an incoming request the rate limiter looks at.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    /// Socket peer address
    pub peer_addr: Option<IpAddr>,
    /// Header map with lowercase names
    pub headers: HashMap<String, String>,
    /// Authenticated user id, if any
    pub user_id: Option<String>,
    /// Role of the authenticated user, if any
    pub role: Option<String>,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_peer(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn user_agent(&self) -> &str {
        self.header(USER_AGENT).unwrap_or_default()
    }
}

/// Derives the identity part of a bucket key.
#[derive(Clone, Default)]
pub struct IdentityResolver {
    trust_proxy: bool,
    user_resolver: Option<UserIdResolver>,
}

impl fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("trust_proxy", &self.trust_proxy)
            .field("user_resolver", &self.user_resolver.is_some())
            .finish()
    }
}

impl IdentityResolver {
    pub fn new(trust_proxy: bool) -> Self {
        Self {
            trust_proxy,
            user_resolver: None,
        }
    }

    pub fn with_user_resolver(mut self, resolver: UserIdResolver) -> Self {
        self.user_resolver = Some(resolver);
        self
    }

    /// Client address, using the first forwarded hop when the proxy is trusted.
    pub fn client_ip(&self, ctx: &RequestContext) -> String {
        if self.trust_proxy {
            let forwarded = ctx
                .header(FORWARDED_FOR)
                .and_then(|chain| chain.split(',').next())
                .map(str::trim)
                .filter(|hop| !hop.is_empty());
            if let Some(hop) = forwarded {
                return hop.to_string();
            }
            if let Some(real_ip) = ctx.header(REAL_IP).map(str::trim).filter(|ip| !ip.is_empty()) {
                return real_ip.to_string();
            }
        }
        ctx.peer_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| UNKNOWN_IP.to_string())
    }

    pub fn identity(&self, strategy: KeyStrategy, ctx: &RequestContext) -> String {
        match strategy {
            KeyStrategy::Ip => self.client_ip(ctx),
            KeyStrategy::IpUa => format!("{}:{}", self.client_ip(ctx), ctx.user_agent()),
            KeyStrategy::User => ctx
                .user_id
                .clone()
                .or_else(|| self.user_resolver.as_ref().and_then(|resolve| resolve(ctx)))
                .unwrap_or_else(|| format!("anon:{}:{}", self.client_ip(ctx), ctx.user_agent())),
        }
    }
}

/// A key that uniquely identifies a token bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub prefix: String,
    pub strategy: KeyStrategy,
    pub identity: String,
    pub method: String,
    pub path: String,
}

impl BucketKey {
    pub fn new(policy: &Policy, identity: String, ctx: &RequestContext) -> Self {
        Self {
            prefix: policy.prefix.clone(),
            strategy: policy.key_strategy,
            identity,
            method: ctx.method.clone(),
            path: ctx.path.clone(),
        }
    }

    /// Render as `{prefix}{strategy}:{identity}:{method}:{path}`.
    pub fn to_string_key(&self) -> String {
        format!(
            "{}{}:{}:{}:{}",
            self.prefix, self.strategy, self.identity, self.method, self.path
        )
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
