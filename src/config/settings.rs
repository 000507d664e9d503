use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use super::policy::ShieldPolicy;
use crate::core::{default_rules, GeoPolicy, RateLimitPolicy, RateLimitStrategy, RuleSpec};
use crate::utils::WafResult;

/// Configuration settings for the request shield
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server configuration
    pub server: ServerConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Geolocation policy
    pub geo: GeoConfig,
    /// Ordered detection rules
    pub rules: Vec<RuleSpec>,
    /// Audit log configuration
    pub audit: AuditConfig,
    /// Metrics exporter configuration
    pub metrics: MetricsConfig,
}

/// Server configuration settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind the server to
    pub host: String,
    /// Port number to listen on
    pub port: u16,
    /// Largest form body buffered for inspection
    pub max_body_bytes: usize,
}

/// Rate limiting configuration settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum number of requests allowed per period
    pub max_requests: u32,
    /// Time period in seconds for rate limiting
    pub period_seconds: u64,
    pub strategy: RateLimitStrategy,
    /// Bound on one limiter decision before it fails open
    pub acquire_timeout_ms: u64,
    /// Let whitelisted sources skip the limiter
    pub whitelist_bypass: bool,
    /// Namespace for counter keys in shared stores
    pub key_prefix: String,
}

/// Redis configuration settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL; counters stay in process memory when unset
    pub url: Option<String>,
}

/// Geolocation policy settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// ISO-3166 alpha-2 codes to block
    pub blocked_countries: Vec<String>,
    /// Addresses or networks that are never geo blocked
    pub whitelist: Vec<String>,
    pub lookup_timeout_ms: u64,
    /// Network to country table, e.g. `"203.0.113.0/24" = "US"`
    pub networks: BTreeMap<String, String>,
}

/// Audit log settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Append blocked requests to this file; tracing only when unset
    pub log_path: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Metrics exporter settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus listener address, e.g. `0.0.0.0:9000`
    pub listen: Option<String>,
}

impl Settings {
    /// Load configuration from an optional file and environment variables.
    ///
    /// The file is `shield.toml` unless `SHIELD_CONFIG` names another one.
    /// Environment variables use the `SHIELD` prefix and `__` as separator,
    /// e.g. `SHIELD_RATE_LIMIT__MAX_REQUESTS=50`.
    pub fn load() -> Result<Self, config::ConfigError> {
        let path = env::var("SHIELD_CONFIG").unwrap_or_else(|_| "shield.toml".to_string());

        let builder = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("SHIELD")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("geo.blocked_countries")
                    .with_list_parse_key("geo.whitelist")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate and freeze into the policy the pipeline runs with.
    pub fn build_policy(&self) -> WafResult<ShieldPolicy> {
        let geo = GeoPolicy::parse(
            &self.geo.blocked_countries,
            &self.geo.whitelist,
            (self.geo.lookup_timeout_ms > 0).then(|| Duration::from_millis(self.geo.lookup_timeout_ms)),
        )?;

        let rate_limit = RateLimitPolicy {
            max_requests: self.rate_limit.max_requests,
            window: Duration::from_secs(self.rate_limit.period_seconds),
            acquire_timeout: Duration::from_millis(self.rate_limit.acquire_timeout_ms),
            strategy: self.rate_limit.strategy,
        };

        let mut policy = ShieldPolicy::new(self.rules.clone(), geo, rate_limit)
            .with_whitelist_bypass(self.rate_limit.whitelist_bypass);
        if let Some(ms) = self.audit.timeout_ms {
            policy = policy.with_audit_timeout(Duration::from_millis(ms));
        }
        policy.validate()?;
        Ok(policy)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            redis: RedisConfig::default(),
            geo: GeoConfig::default(),
            rules: default_rules(),
            audit: AuditConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            max_body_bytes: 64 * 1024,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            period_seconds: 3600,
            strategy: RateLimitStrategy::FixedWindow,
            acquire_timeout_ms: 250,
            whitelist_bypass: false,
            key_prefix: "rate_limit:".to_string(),
        }
    }
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            blocked_countries: ["RU", "SA", "IR", "CN", "IN"].map(String::from).to_vec(),
            whitelist: vec!["127.0.0.1".to_string()],
            lookup_timeout_ms: 100,
            networks: BTreeMap::new(),
        }
    }
}
