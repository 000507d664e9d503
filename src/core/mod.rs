//! Core functionality for the request shield.
//! This module contains the leaf components the pipeline combines:
//! pattern detection, geolocation policy, rate limiting and auditing.

pub mod audit;
pub mod clock;
pub mod counter_store;
pub mod geo;
pub mod rate_limiter;
pub mod rules;

pub use audit::{AuditRecord, AuditSink, FileAuditSink, TracingAuditSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter_store::{CounterStore, MemoryCounterStore, RedisCounterStore, WindowRecord};
pub use geo::{
    Classification, CountryCode, CountryLookup, GeoClassifier, GeoPolicy, LookupResult,
    StaticCountryLookup,
};
pub use rate_limiter::{Admission, RateLimitPolicy, RateLimitStatus, RateLimitStrategy, RateLimiter};
pub use rules::{default_rules, PatternMatcher, Rule, RuleSet, RuleSpec};
