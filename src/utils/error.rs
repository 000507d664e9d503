use thiserror::Error;

/// Errors raised by the request shield.
///
/// Only configuration-time variants are fatal. Runtime failures from the
/// counter store, geolocation lookups and audit sinks are folded by the
/// component that observes them and never escape `evaluate`.
#[derive(Error, Debug)]
pub enum WafError {
    /// Configuration source could not be read or deserialized
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A detection rule did not compile
    #[error("Invalid pattern for category '{category}': {source}")]
    InvalidPattern {
        category: String,
        #[source]
        source: regex::Error,
    },

    /// The rule list was empty
    #[error("Rule set is empty; refusing to run without detection rules")]
    EmptyRuleSet,

    /// A policy value was out of range or malformed
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Redis related errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Record encoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for request shield operations
pub type WafResult<T> = Result<T, WafError>;
