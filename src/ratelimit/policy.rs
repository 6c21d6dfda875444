//! Rate limit policies and their precedence.
//!
//! A policy is resolved per request from three levels. The global default is the
//! base, a role override (when the caller's role is configured) is applied on top,
//! and a route override is applied last. Every field is overridden independently;
//! anything a level leaves unset is inherited from the level below.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, ShopgateError};

/// How the identity part of a bucket key is derived from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Client IP address
    #[default]
    Ip,
    /// Authenticated user, falling back to an anonymous IP + user agent identity
    User,
    /// Client IP address combined with the user agent
    IpUa,
}

impl KeyStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStrategy::Ip => "ip",
            KeyStrategy::User => "user",
            KeyStrategy::IpUa => "ip_ua",
        }
    }
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully resolved token bucket policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Tokens added per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate_per_sec: f64,

    /// Maximum tokens a bucket holds
    #[serde(default = "default_burst_capacity")]
    pub burst_capacity: u32,

    /// Tokens taken by one request
    #[serde(default = "default_cost")]
    pub cost: u32,

    #[serde(default)]
    pub key_strategy: KeyStrategy,

    /// Prepended to every bucket key
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Idle time after which a bucket may be swept
    #[serde(default = "default_idle_expire")]
    pub idle_expire_secs: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            refill_rate_per_sec: default_refill_rate(),
            burst_capacity: default_burst_capacity(),
            cost: default_cost(),
            key_strategy: KeyStrategy::default(),
            prefix: default_prefix(),
            idle_expire_secs: default_idle_expire(),
        }
    }
}

fn default_refill_rate() -> f64 {
    10.0
}

fn default_burst_capacity() -> u32 {
    20
}

fn default_cost() -> u32 {
    1
}

fn default_prefix() -> String {
    "rl:".to_string()
}

fn default_idle_expire() -> u64 {
    600
}

impl Policy {
    /// Check that every field is within bounds.
    pub fn validate(&self) -> Result<()> {
        check_refill_rate(self.refill_rate_per_sec)?;
        check_positive("burst_capacity", self.burst_capacity as u64)?;
        check_positive("cost", self.cost as u64)?;
        check_positive("idle_expire_secs", self.idle_expire_secs)
    }

    /// Return a copy with every field set in `layer` replaced.
    pub fn merged(&self, layer: &PolicyOverride) -> Policy {
        Policy {
            refill_rate_per_sec: layer.refill_rate_per_sec.unwrap_or(self.refill_rate_per_sec),
            burst_capacity: layer.burst_capacity.unwrap_or(self.burst_capacity),
            cost: layer.cost.unwrap_or(self.cost),
            key_strategy: layer.key_strategy.unwrap_or(self.key_strategy),
            prefix: layer.prefix.clone().unwrap_or_else(|| self.prefix.clone()),
            idle_expire_secs: layer.idle_expire_secs.unwrap_or(self.idle_expire_secs),
        }
    }

    pub fn idle_expire_millis(&self) -> u64 {
        self.idle_expire_secs.saturating_mul(1000)
    }
}

/// A partial policy used for role and route overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_rate_per_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_capacity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_strategy: Option<KeyStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_expire_secs: Option<u64>,
}

impl PolicyOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refill_rate_per_sec(mut self, rate: f64) -> Self {
        self.refill_rate_per_sec = Some(rate);
        self
    }

    pub fn burst_capacity(mut self, capacity: u32) -> Self {
        self.burst_capacity = Some(capacity);
        self
    }

    pub fn cost(mut self, cost: u32) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = Some(strategy);
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn idle_expire_secs(mut self, secs: u64) -> Self {
        self.idle_expire_secs = Some(secs);
        self
    }

    /// Check the fields that are set.
    ///
    /// Because fields merge independently, a valid override applied to a valid
    /// policy always yields a valid policy.
    pub fn validate(&self) -> Result<()> {
        if let Some(rate) = self.refill_rate_per_sec {
            check_refill_rate(rate)?;
        }
        if let Some(capacity) = self.burst_capacity {
            check_positive("burst_capacity", capacity as u64)?;
        }
        if let Some(cost) = self.cost {
            check_positive("cost", cost as u64)?;
        }
        if let Some(secs) = self.idle_expire_secs {
            check_positive("idle_expire_secs", secs)?;
        }
        Ok(())
    }
}

fn check_refill_rate(rate: f64) -> Result<()> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(ShopgateError::InvalidPolicy(format!(
            "refill_rate_per_sec must be a positive number, got {}",
            rate
        )))
    }
}

fn check_positive(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(ShopgateError::InvalidPolicy(format!(
            "{} must be greater than zero",
            field
        )));
    }
    Ok(())
}

/// Resolves the effective policy for a request.
///
/// Role names match case-insensitively; layered config sources lowercase map keys.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    global: Policy,
    roles: HashMap<String, PolicyOverride>,
}

impl PolicyResolver {
    pub fn new(global: Policy, roles: HashMap<String, PolicyOverride>) -> Result<Self> {
        global.validate()?;
        let mut normalized = HashMap::with_capacity(roles.len());
        for (role, layer) in roles {
            layer.validate()?;
            let key = role.to_lowercase();
            if normalized.insert(key, layer).is_some() {
                return Err(ShopgateError::InvalidPolicy(format!(
                    "role '{}' is configured more than once (role names ignore case)",
                    role
                )));
            }
        }
        Ok(Self {
            global,
            roles: normalized,
        })
    }

    pub fn global(&self) -> &Policy {
        &self.global
    }

    /// Apply the role and route layers over the global default.
    pub fn resolve(&self, role: Option<&str>, route: Option<&PolicyOverride>) -> Policy {
        let mut policy = match role.and_then(|r| self.roles.get(&r.to_lowercase())) {
            Some(layer) => self.global.merged(layer),
            None => self.global.clone(),
        };
        if let Some(layer) = route {
            policy = policy.merged(layer);
        }
        policy
    }
}
