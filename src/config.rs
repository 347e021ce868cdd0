//! Configuration management for ratewindow.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

use crate::error::{RateWindowError, Result};
use crate::ratelimit::{LimitConfig, Strategy, DEFAULT_THRESHOLD, DEFAULT_TIME_INTERVAL_MS};

/// Prefix for structured environment overrides, e.g.
/// `RATEWINDOW__LIMITER__STRATEGY=sliding-window-list`.
const ENV_PREFIX: &str = "RATEWINDOW";

/// Plain environment names that override single limiter settings.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("THRESHOLD", "limiter.threshold"),
    ("TIME_INTERVAL", "limiter.time_interval_ms"),
    ("MEMCACHED_URL", "limiter.memcached_url"),
    ("REDIS_URL", "limiter.redis_url"),
];

/// Main configuration for the ratewindow service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateWindowConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Which strategy to run
    #[serde(default)]
    pub strategy: Strategy,

    /// Maximum actions per caller per window
    #[serde(default = "default_threshold")]
    pub threshold: u64,

    /// Window length in milliseconds
    #[serde(default = "default_time_interval")]
    pub time_interval_ms: u64,

    /// Memcached address for the fixed-window shared cache
    #[serde(default = "default_memcached_url")]
    pub memcached_url: String,

    /// Redis URL for the shared sliding-window strategies
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace for caller keys in shared stores
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            threshold: default_threshold(),
            time_interval_ms: default_time_interval(),
            memcached_url: default_memcached_url(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl LimiterConfig {
    /// The validated threshold and window.
    pub fn limits(&self) -> Result<LimitConfig> {
        LimitConfig::new(self.threshold, self.time_interval_ms)
    }
}

fn default_threshold() -> u64 {
    DEFAULT_THRESHOLD
}

fn default_time_interval() -> u64 {
    DEFAULT_TIME_INTERVAL_MS
}

fn default_memcached_url() -> String {
    "localhost:11211".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "ratewindow".to_string()
}

impl RateWindowConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateWindowConfig =
            serde_yaml::from_str(yaml).map_err(|e| RateWindowError::Config(e.to_string()))?;
        config.limiter.limits()?;
        Ok(config)
    }

    /// Layer defaults, an optional config file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, std::env::vars().collect())
    }

    /// Like [`load`](Self::load) with an explicit environment.
    pub fn load_from(path: Option<&Path>, env: config::Map<String, String>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(Some(env.clone())),
        );

        for (var, key) in ENV_OVERRIDES {
            builder = builder.set_override_option(*key, env.get(*var).cloned())?;
        }

        let config: RateWindowConfig = builder.build()?.try_deserialize()?;
        config.limiter.limits()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> config::Map<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = RateWindowConfig::default();
        assert_eq!(config.server.http_addr.port(), 8080);
        assert_eq!(config.limiter.strategy, Strategy::FixedWindowInMemory);
        assert_eq!(config.limiter.threshold, 5);
        assert_eq!(config.limiter.time_interval_ms, 600_000);
        assert_eq!(config.limiter.memcached_url, "localhost:11211");
        assert_eq!(config.limiter.redis_url, "redis://localhost:6379");
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
limiter:
  strategy: sliding-window-redis-sorted-set
  threshold: 10
"#;
        let config = RateWindowConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.strategy, Strategy::SlidingWindowRedisSortedSet);
        assert_eq!(config.limiter.threshold, 10);
        assert_eq!(config.limiter.time_interval_ms, 600_000);
        assert_eq!(config.server.http_addr, default_http_addr());
    }

    #[test]
    fn test_from_yaml_rejects_zero_interval() {
        let yaml = "limiter:\n  time_interval_ms: 0\n";
        assert!(matches!(
            RateWindowConfig::from_yaml(yaml),
            Err(RateWindowError::Config(_))
        ));
    }

    #[test]
    fn test_from_yaml_rejects_unknown_strategy() {
        let yaml = "limiter:\n  strategy: leaky-bucket\n";
        assert!(RateWindowConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_load_without_sources_uses_defaults() {
        let config = RateWindowConfig::load_from(None, env(&[])).unwrap();
        assert_eq!(config.limiter.threshold, 5);
        assert_eq!(config.limiter.key_prefix, "ratewindow");
    }

    #[test]
    fn test_load_plain_env_overrides() {
        let config = RateWindowConfig::load_from(
            None,
            env(&[
                ("THRESHOLD", "7"),
                ("TIME_INTERVAL", "1000"),
                ("REDIS_URL", "redis://cache:6379"),
            ]),
        )
        .unwrap();

        assert_eq!(config.limiter.threshold, 7);
        assert_eq!(config.limiter.time_interval_ms, 1000);
        assert_eq!(config.limiter.redis_url, "redis://cache:6379");
    }

    #[test]
    fn test_load_prefixed_env() {
        let config = RateWindowConfig::load_from(
            None,
            env(&[
                ("RATEWINDOW__LIMITER__STRATEGY", "sliding-window-list"),
                ("RATEWINDOW__SERVER__HTTP_ADDR", "0.0.0.0:9000"),
            ]),
        )
        .unwrap();

        assert_eq!(config.limiter.strategy, Strategy::SlidingWindowList);
        assert_eq!(config.server.http_addr.port(), 9000);
    }

    #[test]
    fn test_plain_env_beats_prefixed_env() {
        let config = RateWindowConfig::load_from(
            None,
            env(&[("RATEWINDOW__LIMITER__THRESHOLD", "3"), ("THRESHOLD", "9")]),
        )
        .unwrap();
        assert_eq!(config.limiter.threshold, 9);
    }

    #[test]
    fn test_load_rejects_zero_threshold() {
        let result = RateWindowConfig::load_from(None, env(&[("THRESHOLD", "0")]));
        assert!(result.is_err());
    }
}
