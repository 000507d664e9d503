//! Configuration management for the request shield.
//! Settings are loaded once at startup from an optional TOML file and
//! environment variables, then frozen into a [`ShieldPolicy`].

mod policy;
mod settings;

pub use policy::ShieldPolicy;
pub use settings::{
    AuditConfig, GeoConfig, MetricsConfig, RateLimitConfig, RedisConfig, ServerConfig, Settings,
};
