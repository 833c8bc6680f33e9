//! Configuration for the multi-layer cache.
//!
//! The orchestrator accepts a pre-validated configuration snapshot; parsing
//! from files or process environment belongs to the embedding application.
//! Validation happens once at boot and is fatal on hard issues; soft issues
//! are returned as warnings and logged, never blocking startup.
//!
//! Configuration is frozen after construction. Reloads require building a
//! new orchestrator instance.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Deployment environment, driving validation strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Testing,
    Production,
}

impl Environment {
    #[must_use]
    pub fn is_production(self) -> bool {
        self == Self::Production
    }

    #[must_use]
    pub fn is_testing(self) -> bool {
        self == Self::Testing
    }
}

/// How writes propagate across tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoherencyProtocol {
    WriteThrough,
    WriteBehind,
    WriteBack,
    Invalidate,
    Broadcast,
}

/// Consistency target for cross-tier convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    Strong,
    Eventual,
    Weak,
    Causal,
}

/// How deletes reach tiers that were not part of the original operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationStrategy {
    Immediate,
    Lazy,
    TtlBased,
    VersionBased,
}

/// L1 in-memory tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct L1Config {
    pub enabled: bool,
    /// Hard byte budget for the whole tier.
    pub total_bytes: usize,
    pub hot_bytes: usize,
    pub warm_bytes: usize,
    pub cold_bytes: usize,
    pub default_ttl: Duration,
    /// Interval for the expiry sweep and idle-demotion pass.
    pub cleanup_interval: Duration,
    /// Hits within the current band before an entry moves one band hotter.
    pub promotion_threshold: u64,
    /// Entries idle longer than this move one band colder.
    pub demotion_window: Duration,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            enabled: true,
            total_bytes: 128 * 1024 * 1024,
            hot_bytes: 32 * 1024 * 1024,
            warm_bytes: 64 * 1024 * 1024,
            cold_bytes: 32 * 1024 * 1024,
            default_ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(60),
            promotion_threshold: 3,
            demotion_window: Duration::from_secs(300),
        }
    }
}

/// L2 distributed tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct L2Config {
    pub enabled: bool,
    pub default_ttl: Duration,
    /// Hard ceiling on any stored TTL.
    pub max_ttl: Duration,
    /// Chunk size for mget/mset and write-behind flushes.
    pub batch_size: usize,
    pub compression_enabled: bool,
    pub compression_threshold_bytes: usize,
    pub write_behind_enabled: bool,
    pub write_behind_interval: Duration,
    /// Retry budget for a failed write-behind flush before items are dropped.
    pub write_behind_max_attempts: u32,
    /// Pending-queue cap; a full queue degrades that set to write-through.
    pub write_behind_queue_max: usize,
    /// How long `stop_write_behind` may spend draining the queue.
    pub write_behind_drain_deadline: Duration,
    /// TTL multiplier applied to keys flagged hot at the call site.
    pub hot_ttl_multiplier: f64,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(7200),
            max_ttl: Duration::from_secs(86_400),
            batch_size: 100,
            compression_enabled: true,
            compression_threshold_bytes: 1024,
            write_behind_enabled: false,
            write_behind_interval: Duration::from_secs(30),
            write_behind_max_attempts: 3,
            write_behind_queue_max: 10_000,
            write_behind_drain_deadline: Duration::from_secs(5),
            hot_ttl_multiplier: 2.0,
        }
    }
}

/// L3 edge/CDN tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct L3Config {
    pub enabled: bool,
    /// Provider identity, e.g. `"cloudfront"`. Informational for the generic
    /// HTTP provider; meaningful for provider-specific integrations.
    pub provider: String,
    /// Public domain CDN URLs are derived from.
    pub domain_name: String,
    /// Origin the provider uploads objects to and purges against.
    pub origin_domain: String,
    pub default_ttl: Duration,
    /// TTL for static assets.
    pub static_ttl: Duration,
    /// TTL for cached API responses.
    pub api_ttl: Duration,
    pub ssl_required: bool,
}

impl Default for L3Config {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "cloudfront".to_string(),
            domain_name: String::new(),
            origin_domain: String::new(),
            default_ttl: Duration::from_secs(86_400),
            static_ttl: Duration::from_secs(30 * 86_400),
            api_ttl: Duration::from_secs(3600),
            ssl_required: true,
        }
    }
}

/// Remote backend cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    pub enabled: bool,
    /// Node connection URLs, e.g. `redis://10.0.0.1:6379`.
    pub nodes: Vec<String>,
    pub replication_factor: u32,
    /// Per-operation deadline for remote calls.
    pub timeout: Duration,
    pub max_connections: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            nodes: Vec::new(),
            replication_factor: 2,
            timeout: Duration::from_secs(5),
            max_connections: 50,
        }
    }
}

/// Cross-tier coherency configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoherencyConfig {
    pub protocol: CoherencyProtocol,
    pub consistency: ConsistencyLevel,
    pub invalidation_strategy: InvalidationStrategy,
    /// Interval of the background divergence check.
    pub check_interval: Duration,
    pub versioning_enabled: bool,
    /// Concurrent fan-out budget; excess propagations are dropped and counted.
    pub max_concurrent_fanout: usize,
    /// Keys examined per divergence-check pass.
    pub check_batch: usize,
}

impl Default for CoherencyConfig {
    fn default() -> Self {
        Self {
            protocol: CoherencyProtocol::WriteThrough,
            consistency: ConsistencyLevel::Eventual,
            invalidation_strategy: InvalidationStrategy::Immediate,
            check_interval: Duration::from_secs(300),
            versioning_enabled: true,
            max_concurrent_fanout: 8,
            check_batch: 64,
        }
    }
}

/// Top-level configuration for the multi-layer cache orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Master switch; when false the orchestrator is a no-op returning misses.
    pub multi_layer_enabled: bool,
    /// Deployment-unique key namespace; should end in a separator.
    pub key_prefix: String,
    pub l1: L1Config,
    pub l2: L2Config,
    pub l3: L3Config,
    pub cluster: ClusterConfig,
    pub coherency: CoherencyConfig,
    pub warming_enabled: bool,
    pub warming_batch_size: usize,
    /// Periodically refresh remote TTLs for the hottest L1 keys.
    pub prefetch_popular: bool,
    pub metrics_enabled: bool,
    pub metrics_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            multi_layer_enabled: true,
            key_prefix: "strata:dev:".to_string(),
            l1: L1Config::default(),
            l2: L2Config::default(),
            l3: L3Config::default(),
            cluster: ClusterConfig::default(),
            coherency: CoherencyConfig::default(),
            warming_enabled: true,
            warming_batch_size: 50,
            prefetch_popular: false,
            metrics_enabled: true,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Defaults sized for the given environment.
    #[must_use]
    pub fn for_environment(env: Environment) -> Self {
        let mut config = Self::default();
        let mb = 1024 * 1024;
        match env {
            Environment::Production => {
                config.l1.total_bytes = 256 * mb;
                config.l1.hot_bytes = 64 * mb;
                config.l1.warm_bytes = 128 * mb;
                config.l1.cold_bytes = 64 * mb;
                config.key_prefix = "strata:prod:".to_string();
            }
            Environment::Testing => {
                config.l1.total_bytes = 32 * mb;
                config.l1.hot_bytes = 8 * mb;
                config.l1.warm_bytes = 16 * mb;
                config.l1.cold_bytes = 8 * mb;
                config.key_prefix = "strata:test:".to_string();
            }
            Environment::Development => {}
        }
        config
    }

    /// Validate the configuration for the given environment.
    ///
    /// Returns the list of non-blocking warnings on success.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] with every hard issue found.
    pub fn validate(&self, env: Environment) -> Result<Vec<String>, ConfigError> {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        if self.multi_layer_enabled && !self.l1.enabled && !self.l2.enabled {
            issues.push("multi-layer caching enabled but no cache tier configured".to_string());
        }

        if self.l1.enabled {
            if self.l1.total_bytes == 0 {
                issues.push("l1.total_bytes must be positive".to_string());
            }
            let band_sum = self.l1.hot_bytes + self.l1.warm_bytes + self.l1.cold_bytes;
            if band_sum > self.l1.total_bytes {
                issues.push(format!(
                    "l1 band capacities ({band_sum} bytes) exceed l1.total_bytes ({})",
                    self.l1.total_bytes
                ));
            }
            if self.l1.default_ttl.is_zero() {
                issues.push("l1.default_ttl must be positive".to_string());
            }
            if self.l1.cleanup_interval.is_zero() {
                issues.push("l1.cleanup_interval must be positive".to_string());
            }
            if self.l1.promotion_threshold == 0 {
                issues.push("l1.promotion_threshold must be positive".to_string());
            }
            if env.is_production() && self.l1.total_bytes > 512 * 1024 * 1024 {
                warnings.push("l1 cache size above 512MB may pressure process memory".to_string());
            }
        }

        if self.l2.enabled {
            if self.l2.default_ttl.is_zero() {
                issues.push("l2.default_ttl must be positive".to_string());
            }
            if self.l2.max_ttl < self.l2.default_ttl {
                issues.push("l2.max_ttl cannot be less than l2.default_ttl".to_string());
            }
            if self.l2.batch_size == 0 {
                issues.push("l2.batch_size must be positive".to_string());
            }
            if self.l2.write_behind_enabled && self.l2.write_behind_interval.is_zero() {
                issues.push("l2.write_behind_interval must be positive".to_string());
            }
            if self.l2.hot_ttl_multiplier < 1.0 {
                warnings.push("l2.hot_ttl_multiplier below 1.0 has no effect".to_string());
            }
        }

        if self.l3.enabled {
            if !self.l2.enabled {
                issues.push("l3 edge cache requires the l2 tier to be enabled".to_string());
            }
            if self.l3.domain_name.is_empty() {
                issues.push("l3 enabled but domain_name not configured".to_string());
            }
            if self.l3.origin_domain.is_empty() {
                issues.push("l3 enabled but origin_domain not configured".to_string());
            }
            if self.l3.default_ttl.is_zero() {
                issues.push("l3.default_ttl must be positive".to_string());
            }
            if env.is_production() && !self.l3.ssl_required {
                issues.push("l3 ssl_required must be enabled in production".to_string());
            }
        }

        if self.cluster.enabled {
            if self.cluster.nodes.is_empty() {
                issues.push("cluster enabled but no nodes configured".to_string());
            }
            if self.cluster.timeout.is_zero() {
                issues.push("cluster.timeout must be positive".to_string());
            }
            if self.cluster.max_connections == 0 {
                issues.push("cluster.max_connections must be positive".to_string());
            }
            if env.is_production() && self.cluster.replication_factor < 2 {
                warnings.push("production cluster should use replication_factor >= 2".to_string());
            }
        }

        if env.is_production() && self.coherency.consistency == ConsistencyLevel::Weak {
            issues.push("weak consistency is not allowed in production".to_string());
        }
        if self.coherency.check_interval.is_zero() {
            issues.push("coherency.check_interval must be positive".to_string());
        }
        if self.coherency.max_concurrent_fanout == 0 {
            issues.push("coherency.max_concurrent_fanout must be positive".to_string());
        }

        if self.warming_enabled && self.warming_batch_size == 0 {
            issues.push("warming_batch_size must be positive".to_string());
        }
        if self.metrics_enabled && self.metrics_interval.is_zero() {
            issues.push("metrics_interval must be positive".to_string());
        }

        let ends_with_separator = self
            .key_prefix
            .chars()
            .last()
            .is_some_and(|c| c == ':' || c == '/');
        if !self.key_prefix.is_empty() && !ends_with_separator {
            warnings.push(format!(
                "key_prefix '{}' does not end with a separator",
                self.key_prefix
            ));
        }

        if issues.is_empty() {
            Ok(warnings)
        } else {
            Err(ConfigError::new(issues))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        let config = CacheConfig::default();
        let warnings = config.validate(Environment::Development).unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
    }

    #[test]
    fn band_sum_over_total_is_fatal() {
        let mut config = CacheConfig::default();
        config.l1.total_bytes = 100;
        config.l1.hot_bytes = 50;
        config.l1.warm_bytes = 50;
        config.l1.cold_bytes = 50;
        let err = config.validate(Environment::Development).unwrap_err();
        assert!(err.issues.iter().any(|i| i.contains("band capacities")));
    }

    #[test]
    fn l3_requires_l2() {
        let mut config = CacheConfig::default();
        config.l2.enabled = false;
        config.l3.enabled = true;
        config.l3.domain_name = "cdn.example.com".to_string();
        config.l3.origin_domain = "origin.example.com".to_string();
        let err = config.validate(Environment::Development).unwrap_err();
        assert!(err.issues.iter().any(|i| i.contains("requires the l2 tier")));
    }

    #[test]
    fn zero_ttl_is_fatal() {
        let mut config = CacheConfig::default();
        config.l2.default_ttl = Duration::ZERO;
        assert!(config.validate(Environment::Development).is_err());
    }

    #[test]
    fn weak_consistency_rejected_in_production() {
        let mut config = CacheConfig::for_environment(Environment::Production);
        config.coherency.consistency = ConsistencyLevel::Weak;
        let err = config.validate(Environment::Production).unwrap_err();
        assert!(err.issues.iter().any(|i| i.contains("weak consistency")));

        // The same setting is merely legal elsewhere.
        config.key_prefix = "strata:dev:".to_string();
        assert!(config.validate(Environment::Development).is_ok());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let parsed: Result<CacheConfig, _> =
            serde_json::from_str(r#"{"key_prefix": "x:", "no_such_option": true}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn unknown_enum_values_are_rejected() {
        let parsed: Result<CoherencyConfig, _> =
            serde_json::from_str(r#"{"protocol": "write_around"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn prefix_without_separator_warns() {
        let mut config = CacheConfig::default();
        config.key_prefix = "strata".to_string();
        let warnings = config.validate(Environment::Development).unwrap();
        assert!(warnings.iter().any(|w| w.contains("separator")));
    }
}
