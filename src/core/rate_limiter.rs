use chrono::{DateTime, Duration as ChronoDuration, Utc};
use governor::{DefaultKeyedRateLimiter, Quota};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::core::clock::Clock;
use crate::core::counter_store::{CounterStore, WindowRecord};
use crate::utils::{log_fail_open, log_rate_limit, WafError, WafResult};

/// Longest window a policy may configure.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Lost compare-and-set races tolerated by one `admit` before it fails open.
const MAX_CAS_ATTEMPTS: u32 = 256;

/// Counting strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// Fixed window restarting at the first request after expiry. Counters
    /// live in the configured [`CounterStore`].
    #[default]
    FixedWindow,
    /// GCRA token bucket, local to this process.
    TokenBucket,
}

/// Immutable limiter policy.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    /// Requests admitted per window
    pub max_requests: u32,
    /// Window length
    pub window: Duration,
    /// Upper bound on one `admit` call, store round trips included
    pub acquire_timeout: Duration,
    pub strategy: RateLimitStrategy,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(3600),
            acquire_timeout: Duration::from_millis(250),
            strategy: RateLimitStrategy::FixedWindow,
        }
    }
}

/// Outcome of [`RateLimiter::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied,
}

/// Status information for one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub key: String,
    /// Requests counted in the live window
    pub count: u32,
    pub limit: u32,
    pub remaining: u32,
    /// End of the live window, if there is one
    pub resets_at: Option<DateTime<Utc>>,
}

enum Backend {
    FixedWindow(Arc<dyn CounterStore>),
    TokenBucket(DefaultKeyedRateLimiter<String>),
}

/// Per-key rate limiter.
///
/// With the fixed-window strategy every decision is a read followed by a
/// compare-and-set against the shared store, retried until it lands, so the
/// check and the increment are atomic per key for every process sharing the
/// store. Store failures and timeouts admit the request.
pub struct RateLimiter {
    backend: Backend,
    clock: Arc<dyn Clock>,
    limit: u32,
    window: ChronoDuration,
    acquire_timeout: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter instance
    pub fn new(
        policy: &RateLimitPolicy,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> WafResult<Self> {
        let limit = NonZeroU32::new(policy.max_requests)
            .ok_or_else(|| WafError::InvalidPolicy("max_requests must be at least 1".into()))?;
        if policy.window.is_zero() || policy.window > MAX_WINDOW {
            return Err(WafError::InvalidPolicy(format!(
                "rate limit window must be between 1s and {}s",
                MAX_WINDOW.as_secs()
            )));
        }
        let window = ChronoDuration::from_std(policy.window)
            .map_err(|e| WafError::InvalidPolicy(format!("rate limit window out of range: {e}")))?;

        let backend = match policy.strategy {
            RateLimitStrategy::FixedWindow => Backend::FixedWindow(store),
            RateLimitStrategy::TokenBucket => {
                let quota = Quota::with_period(policy.window / limit.get())
                    .ok_or_else(|| {
                        WafError::InvalidPolicy("window too short for the request limit".into())
                    })?
                    .allow_burst(limit);
                Backend::TokenBucket(governor::RateLimiter::keyed(quota))
            }
        };

        Ok(Self {
            backend,
            clock,
            limit: limit.get(),
            window,
            acquire_timeout: policy.acquire_timeout,
        })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Count one request for `key` and decide whether it may proceed.
    pub async fn admit(&self, key: &str) -> Admission {
        let admission = match &self.backend {
            Backend::TokenBucket(buckets) => match buckets.check_key(&key.to_string()) {
                Ok(()) => Admission::Allowed,
                Err(_) => Admission::Denied,
            },
            Backend::FixedWindow(store) => {
                match tokio::time::timeout(self.acquire_timeout, self.admit_fixed(store.as_ref(), key))
                    .await
                {
                    Ok(Ok(admission)) => admission,
                    Ok(Err(e)) => {
                        log_fail_open("rate_limiter", key, &e.to_string());
                        Admission::Allowed
                    }
                    Err(_) => {
                        log_fail_open("rate_limiter", key, "counter store timed out");
                        Admission::Allowed
                    }
                }
            }
        };

        log_rate_limit(key, admission == Admission::Denied);
        admission
    }

    async fn admit_fixed(&self, store: &dyn CounterStore, key: &str) -> WafResult<Admission> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let current = match store.get(key).await {
                Ok(record) => record,
                Err(e) => {
                    // Unreadable counts as absent; the write below still has
                    // to win the compare-and-set.
                    log_fail_open("counter_store", key, &e.to_string());
                    None
                }
            };

            let next = match current {
                Some(record) if !record.is_expired(now, self.window) => {
                    if record.count >= self.limit {
                        return Ok(Admission::Denied);
                    }
                    record.incremented()
                }
                _ => WindowRecord::fresh(now),
            };

            let ttl = next.remaining(now, self.window);
            if store.compare_and_set(key, current.as_ref(), &next, ttl).await? {
                return Ok(Admission::Allowed);
            }

            // Lost the race to another caller; decide again on fresh state.
            tokio::task::yield_now().await;
        }

        log_fail_open("rate_limiter", key, "compare-and-set kept losing");
        Ok(Admission::Allowed)
    }

    /// Drop state for keys that no longer affect any decision.
    ///
    /// Returns how many keys went. Stores that expire keys themselves report 0.
    pub async fn purge(&self) -> WafResult<usize> {
        match &self.backend {
            Backend::FixedWindow(store) => store.purge_expired(self.clock.now(), self.window).await,
            Backend::TokenBucket(buckets) => {
                let before = buckets.len();
                buckets.retain_recent();
                buckets.shrink_to_fit();
                Ok(before.saturating_sub(buckets.len()))
            }
        }
    }

    /// Reset the counter for a key (manual intervention and tests).
    pub async fn reset(&self, key: &str) -> WafResult<()> {
        match &self.backend {
            Backend::FixedWindow(store) => store.remove(key).await,
            Backend::TokenBucket(_) => Err(WafError::Internal(
                "token bucket state cannot be reset per key".into(),
            )),
        }
    }

    /// Get current rate limit status for a key
    pub async fn status(&self, key: &str) -> WafResult<RateLimitStatus> {
        let Backend::FixedWindow(store) = &self.backend else {
            return Err(WafError::Internal(
                "status is only tracked by the fixed window strategy".into(),
            ));
        };

        let now = self.clock.now();
        let live = store
            .get(key)
            .await?
            .filter(|record| !record.is_expired(now, self.window));

        let count = live.map_or(0, |record| record.count);
        Ok(RateLimitStatus {
            key: key.to_string(),
            count,
            limit: self.limit,
            remaining: self.limit.saturating_sub(count),
            resets_at: live.map(|record| record.resets_at(self.window)),
        })
    }
}
