use std::time::Duration;

use crate::core::rate_limiter::MAX_WINDOW;
use crate::core::{GeoPolicy, RateLimitPolicy, RuleSet, RuleSpec};
use crate::utils::{WafError, WafResult};

/// Immutable policy a pipeline is constructed with.
///
/// Nothing in the request path mutates it; changing policy means building a
/// new pipeline.
#[derive(Debug, Clone)]
pub struct ShieldPolicy {
    /// Ordered detection rules; first match wins
    pub rules: Vec<RuleSpec>,
    pub geo: GeoPolicy,
    pub rate_limit: RateLimitPolicy,
    /// Whitelisted sources skip the rate limiter too, not just geo checks
    pub whitelist_bypasses_rate_limit: bool,
    /// Bound on one audit write
    pub audit_timeout: Duration,
}

impl ShieldPolicy {
    pub fn new(rules: Vec<RuleSpec>, geo: GeoPolicy, rate_limit: RateLimitPolicy) -> Self {
        Self {
            rules,
            geo,
            rate_limit,
            whitelist_bypasses_rate_limit: false,
            audit_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_whitelist_bypass(mut self, enabled: bool) -> Self {
        self.whitelist_bypasses_rate_limit = enabled;
        self
    }

    pub fn with_audit_timeout(mut self, timeout: Duration) -> Self {
        self.audit_timeout = timeout;
        self
    }

    /// Reject policies the pipeline cannot run with.
    pub fn validate(&self) -> WafResult<()> {
        RuleSet::compile(&self.rules)?;

        if self.rate_limit.max_requests == 0 {
            return Err(WafError::InvalidPolicy("max_requests must be at least 1".into()));
        }
        if self.rate_limit.window.is_zero() || self.rate_limit.window > MAX_WINDOW {
            return Err(WafError::InvalidPolicy(format!(
                "rate limit window must be between 1s and {}s",
                MAX_WINDOW.as_secs()
            )));
        }
        if self.rate_limit.acquire_timeout.is_zero() {
            return Err(WafError::InvalidPolicy("acquire timeout must be non-zero".into()));
        }
        Ok(())
    }
}
