//! Configuration management for Shopgate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, ShopgateError};
use crate::ratelimit::{Policy, PolicyOverride, PolicyResolver, Whitelist, WhitelistRule};

/// Environment variable prefix for layered configuration (`SHOPGATE__BATCHER__CONCURRENCY=8`).
pub const ENV_PREFIX: &str = "SHOPGATE";

/// Main configuration for Shopgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShopgateConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Background job batcher configuration
    #[serde(default)]
    pub batcher: BatcherConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Global default policy
    #[serde(default)]
    pub default_policy: Policy,

    /// Per-role partial overrides, keyed by role name
    #[serde(default)]
    pub roles: HashMap<String, PolicyOverride>,

    /// Paths that bypass rate limiting entirely
    #[serde(default)]
    pub whitelist: Vec<WhitelistRule>,

    /// Honour X-Forwarded-For / X-Real-IP when resolving the client address
    #[serde(default)]
    pub trust_proxy: bool,

    /// How often idle buckets are swept, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            default_policy: Policy::default(),
            roles: HashMap::new(),
            whitelist: Vec::new(),
            trust_proxy: false,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl RateLimitingConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Check the global policy and every role override.
    pub fn validate(&self) -> Result<()> {
        self.default_policy.validate()?;
        for (role, policy) in &self.roles {
            policy
                .validate()
                .map_err(|e| ShopgateError::Config(format!("role '{}': {}", role, e)))?;
        }
        PolicyResolver::new(self.default_policy.clone(), self.roles.clone())?;
        Whitelist::compile(&self.whitelist)?;
        if self.sweep_interval_secs == 0 {
            return Err(ShopgateError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_sweep_interval() -> u64 {
    60
}

/// Background job batcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Maximum number of jobs executing at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Attempts allowed when `enqueue` does not specify one
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// Backoff applied after the first failure is twice this value
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound for the retry backoff
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Longest the coordinator sleeps while idle
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Coordinator tick while at least one job is running
    #[serde(default = "default_busy_poll")]
    pub busy_poll_ms: u64,

    /// How long shutdown waits for in-flight jobs
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            default_max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            poll_interval_ms: default_poll_interval(),
            busy_poll_ms: default_busy_poll(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl BatcherConfig {
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.concurrency == 0, "concurrency must be greater than zero"),
            (self.default_max_attempts == 0, "default_max_attempts must be greater than zero"),
            (self.initial_backoff_ms == 0, "initial_backoff_ms must be greater than zero"),
            (
                self.max_backoff_ms < self.initial_backoff_ms,
                "max_backoff_ms must be >= initial_backoff_ms",
            ),
            (self.poll_interval_ms == 0, "poll_interval_ms must be greater than zero"),
            (self.busy_poll_ms == 0, "busy_poll_ms must be greater than zero"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(ShopgateError::Config(msg.to_string())),
            None => Ok(()),
        }
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn busy_poll(&self) -> Duration {
        Duration::from_millis(self.busy_poll_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_poll_interval() -> u64 {
    1_000
}

fn default_busy_poll() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    5_000
}

impl ShopgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ShopgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| ShopgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered under `SHOPGATE__*` environment variables.
    ///
    /// Map keys such as role names come back lowercased from this loader.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// `load`, reading variables from `env` instead of the process environment when given.
    fn load_with_env(
        path: Option<&Path>,
        env: Option<::config::Map<String, String>>,
    ) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path));
        }
        let config: ShopgateConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .source(env),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.validate()?;
        self.batcher.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::KeyStrategy;

    #[test]
    fn test_defaults() {
        let config = ShopgateConfig::default();
        assert_eq!(config.batcher.concurrency, 4);
        assert_eq!(config.batcher.initial_backoff(), Duration::from_millis(500));
        assert_eq!(config.batcher.max_backoff(), Duration::from_secs(30));
        assert_eq!(config.rate_limiting.default_policy.cost, 1);
        assert!(!config.rate_limiting.trust_proxy);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
rate_limiting:
  default_policy:
    refill_rate_per_sec: 2
    burst_capacity: 100
    key_strategy: ip_ua
    prefix: "shop:"
    idle_expire_secs: 120
  roles:
    admin:
      burst_capacity: 1000
  whitelist:
    - prefix: /health
    - regex: "^/static/.*\\.css$"
  trust_proxy: true
batcher:
  concurrency: 2
  max_backoff_ms: 10000
"#;
        let config = ShopgateConfig::from_yaml(yaml).unwrap();
        let policy = &config.rate_limiting.default_policy;
        assert_eq!(policy.refill_rate_per_sec, 2.0);
        assert_eq!(policy.burst_capacity, 100);
        assert_eq!(policy.cost, 1);
        assert_eq!(policy.key_strategy, KeyStrategy::IpUa);
        assert_eq!(policy.prefix, "shop:");
        assert_eq!(config.rate_limiting.roles["admin"].burst_capacity, Some(1000));
        assert_eq!(config.rate_limiting.whitelist.len(), 2);
        assert!(config.rate_limiting.trust_proxy);
        assert_eq!(config.batcher.concurrency, 2);
        assert_eq!(config.batcher.max_backoff_ms, 10_000);
        assert_eq!(config.batcher.default_max_attempts, 5);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = ShopgateConfig::from_yaml("{}").unwrap();
        assert_eq!(config.batcher.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.rate_limiting.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let yaml = r#"
rate_limiting:
  default_policy:
    refill_rate_per_sec: 0
"#;
        assert!(ShopgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_role_override_rejected() {
        let yaml = r#"
rate_limiting:
  roles:
    guest:
      cost: 0
"#;
        let err = ShopgateConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("guest"));
    }

    #[test]
    fn test_invalid_batcher_rejected() {
        let mut config = BatcherConfig::default();
        config.max_backoff_ms = 100;
        assert!(config.validate().is_err());

        let mut config = BatcherConfig::default();
        config.concurrency = 0;
        assert!(config.validate().is_err());
    }

    fn temp_config(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("shopgate-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_without_file() {
        let config = ShopgateConfig::load_with_env(None, Some(::config::Map::new())).unwrap();
        assert_eq!(config.batcher.default_max_attempts, 5);
        assert_eq!(config.batcher.concurrency, 4);
        assert!(!config.rate_limiting.trust_proxy);
    }

    #[test]
    fn test_load_env_overrides_file() {
        let path = temp_config("batcher:\n  concurrency: 2\n");
        let env = ::config::Map::from([
            ("SHOPGATE__BATCHER__CONCURRENCY".to_string(), "8".to_string()),
            ("SHOPGATE__RATE_LIMITING__TRUST_PROXY".to_string(), "true".to_string()),
        ]);
        let config = ShopgateConfig::load_with_env(Some(&path), Some(env));
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert_eq!(config.batcher.concurrency, 8);
        assert!(config.rate_limiting.trust_proxy);
    }

    #[test]
    fn test_mixed_case_role_matches_through_every_loader() {
        let yaml = r#"
rate_limiting:
  roles:
    Admin:
      burst_capacity: 1000
"#;
        let path = temp_config(yaml);
        let loaded = ShopgateConfig::load_with_env(Some(&path), Some(::config::Map::new()));
        std::fs::remove_file(&path).unwrap();

        for config in [loaded.unwrap(), ShopgateConfig::from_yaml(yaml).unwrap()] {
            let rate_limiting = config.rate_limiting;
            let resolver =
                PolicyResolver::new(rate_limiting.default_policy, rate_limiting.roles).unwrap();
            assert_eq!(resolver.resolve(Some("Admin"), None).burst_capacity, 1000);
            assert_eq!(resolver.resolve(Some("admin"), None).burst_capacity, 1000);
        }
    }

    #[test]
    fn test_roles_colliding_by_case_rejected() {
        let yaml = r#"
rate_limiting:
  roles:
    Admin:
      burst_capacity: 1000
    admin:
      burst_capacity: 10
"#;
        assert!(ShopgateConfig::from_yaml(yaml).is_err());
    }
}
