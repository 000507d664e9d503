//! Shared helpers for integration tests.
#![allow(dead_code)]

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use request_shield::core::{
    default_rules, AuditRecord, AuditSink, CountryLookup, GeoPolicy, ManualClock,
    MemoryCounterStore, RateLimitPolicy, StaticCountryLookup,
};
use request_shield::utils::WafResult;
use request_shield::{Collaborators, MitigationPipeline, ShieldPolicy};
use tokio::sync::Mutex;

/// Generate a random IP address for testing
pub fn random_ip() -> String {
    format!(
        "{}.{}.{}.{}",
        rand::random::<u8>(),
        rand::random::<u8>(),
        rand::random::<u8>(),
        rand::random::<u8>()
    )
}

pub fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// Default rules, blocking RU and CN, whitelisting 127.0.0.1.
pub fn policy(max_requests: u32, window: Duration) -> ShieldPolicy {
    let geo = GeoPolicy::parse(["RU", "CN"], ["127.0.0.1"], Some(Duration::from_millis(100))).unwrap();
    let rate_limit = RateLimitPolicy {
        max_requests,
        window,
        acquire_timeout: Duration::from_secs(5),
        ..RateLimitPolicy::default()
    };
    ShieldPolicy::new(default_rules(), geo, rate_limit)
}

/// 203.0.113.0/24 is US, 95.163.32.0/24 is RU, 127.0.0.0/8 is CN.
pub fn lookup() -> StaticCountryLookup {
    StaticCountryLookup::from_pairs([
        ("203.0.113.0/24", "US"),
        ("95.163.32.0/24", "RU"),
        ("127.0.0.0/8", "CN"),
    ])
    .unwrap()
}

/// Audit sink keeping every record in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl RecordingSink {
    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl AuditSink for RecordingSink {
    async fn record(&self, record: &AuditRecord) -> WafResult<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

pub struct Harness {
    pub pipeline: MitigationPipeline,
    pub store: Arc<MemoryCounterStore>,
    pub clock: ManualClock,
    pub audit: Arc<RecordingSink>,
}

pub fn harness(policy: &ShieldPolicy) -> Harness {
    harness_with_lookup(policy, Arc::new(lookup()))
}

pub fn harness_with_lookup(policy: &ShieldPolicy, lookup: Arc<dyn CountryLookup>) -> Harness {
    let store = Arc::new(MemoryCounterStore::new());
    let clock = ManualClock::new(epoch());
    let audit = Arc::new(RecordingSink::default());

    let pipeline = MitigationPipeline::new(
        policy,
        Collaborators {
            store: store.clone(),
            lookup,
            audit: audit.clone(),
            clock: Arc::new(clock.clone()),
        },
    )
    .unwrap();

    Harness {
        pipeline,
        store,
        clock,
        audit,
    }
}
