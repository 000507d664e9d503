//! Integration tests for the Redis counter store.
//!
//! These tests require a Redis instance at `redis://127.0.0.1/` and are
//! ignored by default: `cargo test --test redis_store -- --ignored`

mod common;

use futures::future::join_all;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

use common::{epoch, random_ip};
use request_shield::core::{
    Admission, CounterStore, ManualClock, RateLimitPolicy, RateLimiter, RedisCounterStore,
    SystemClock, WindowRecord,
};

const REDIS_URL: &str = "redis://127.0.0.1/";

async fn connect(test_name: &str) -> Option<RedisCounterStore> {
    match RedisCounterStore::connect(REDIS_URL, format!("test:{test_name}:")).await {
        Ok(store) => Some(store),
        Err(e) => {
            eprintln!("Skipping test: Redis not available ({e})");
            None
        }
    }
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_compare_and_set_semantics() {
    let Some(store) = connect("cas").await else { return };
    let key = random_ip();
    let ttl = chrono::Duration::seconds(60);
    store.remove(&key).await.unwrap();

    let first = WindowRecord::fresh(epoch());
    assert!(store.compare_and_set(&key, None, &first, ttl).await.unwrap());
    assert!(!store.compare_and_set(&key, None, &first, ttl).await.unwrap());
    assert_eq!(store.get(&key).await.unwrap(), Some(first));

    let next = first.incremented();
    assert!(store.compare_and_set(&key, Some(&first), &next, ttl).await.unwrap());
    assert!(!store.compare_and_set(&key, Some(&first), &next, ttl).await.unwrap());

    store.remove(&key).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap(), None);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_malformed_record_reads_as_absent_and_is_replaced() {
    let Some(store) = connect("corrupt").await else { return };
    let key = random_ip();

    let client = redis::Client::open(REDIS_URL).unwrap();
    let mut conn = client.get_async_connection().await.unwrap();
    conn.set::<_, _, ()>(format!("test:corrupt:{key}"), "{not json")
        .await
        .unwrap();

    assert_eq!(store.get(&key).await.unwrap(), None);

    let fresh = WindowRecord::fresh(epoch());
    assert!(store
        .compare_and_set(&key, None, &fresh, chrono::Duration::seconds(60))
        .await
        .unwrap());
    assert_eq!(store.get(&key).await.unwrap(), Some(fresh));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore] // Requires Redis
async fn test_limiters_on_separate_connections_share_the_budget() {
    const LIMIT: u32 = 15;
    let key = random_ip();

    let mut limiters = Vec::new();
    for _ in 0..4 {
        let Some(store) = connect("shared").await else { return };
        store.remove(&key).await.unwrap();
        let policy = RateLimitPolicy {
            max_requests: LIMIT,
            window: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(10),
            ..RateLimitPolicy::default()
        };
        limiters.push(Arc::new(
            RateLimiter::new(&policy, Arc::new(store), Arc::new(SystemClock::new())).unwrap(),
        ));
    }

    let handles = (0..60).map(|i| {
        let limiter = Arc::clone(&limiters[i % limiters.len()]);
        let key = key.clone();
        tokio::spawn(async move { limiter.admit(&key).await })
    });
    let allowed = join_all(handles)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(Admission::Allowed)))
        .count();

    assert_eq!(allowed, LIMIT as usize);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_window_expiry_through_redis() {
    let Some(store) = connect("expiry").await else { return };
    let key = random_ip();
    store.remove(&key).await.unwrap();

    let clock = ManualClock::new(epoch());
    let policy = RateLimitPolicy {
        max_requests: 1,
        window: Duration::from_secs(30),
        ..RateLimitPolicy::default()
    };
    let limiter = RateLimiter::new(&policy, Arc::new(store), Arc::new(clock.clone())).unwrap();

    assert_eq!(limiter.admit(&key).await, Admission::Allowed);
    assert_eq!(limiter.admit(&key).await, Admission::Denied);

    clock.advance(chrono::Duration::seconds(30));
    assert_eq!(limiter.admit(&key).await, Admission::Allowed);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_non_canonical_record_is_replaced_on_first_admit() {
    let Some(store) = connect("noncanonical").await else { return };
    let key = random_ip();

    let client = redis::Client::open(REDIS_URL).unwrap();
    let mut conn = client.get_async_connection().await.unwrap();
    conn.set::<_, _, ()>(
        format!("test:noncanonical:{key}"),
        r#"{"count":1,"window_start":1.5e12}"#,
    )
    .await
    .unwrap();

    let store = Arc::new(store);
    let clock = ManualClock::new(epoch());
    let limiter = RateLimiter::new(
        &RateLimitPolicy::default(),
        store.clone(),
        Arc::new(clock.clone()),
    )
    .unwrap();

    assert_eq!(limiter.admit(&key).await, Admission::Allowed);
    assert_eq!(
        store.get(&key).await.unwrap(),
        Some(WindowRecord::fresh(epoch()))
    );
}
