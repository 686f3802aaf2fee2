//! Concurrency limiter against a live Redis server
//!
//! # Running the tests
//!
//! ```bash
//! docker run --rm -p 6379:6379 redis:7
//! DATASET_FETCH_REDIS_HOST=127.0.0.1 DATASET_FETCH_REDIS_PORT=6379 \
//!     cargo test --features redis-tests --test redis_limiter
//! ```

#![cfg(feature = "redis-tests")]

use dataset_fetch::{ConcurrencyLimiter, LimiterConfig, RedisSlotStore, SlotStore, StoreConfig};
use serial_test::serial;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

async fn store() -> Arc<RedisSlotStore> {
    let mut config =
        StoreConfig::from_env().unwrap_or_else(|| StoreConfig::new("127.0.0.1", 6379));
    // keep runs apart from each other and from real workers
    config.key_prefix = format!("dataset-fetch-test-{:08x}", rand::random::<u32>());
    Arc::new(RedisSlotStore::connect(&config).await.unwrap())
}

fn quick_limiter_config() -> LimiterConfig {
    LimiterConfig {
        acquire_timeout: Duration::from_secs(20),
        lease: Duration::from_secs(3),
        poll_interval: Duration::from_millis(5),
        max_poll_interval: Duration::from_millis(50),
    }
}

#[tokio::test]
#[serial]
async fn simulated_workers_never_exceed_the_limit() {
    let store = store().await;
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _worker in 0..4 {
        // each worker owns its limiter; only Redis is shared
        let limiter = ConcurrencyLimiter::new(store.clone(), quick_limiter_config());
        for _ in 0..6 {
            let limiter = limiter.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let guard = limiter.acquire("https://portal.example", Some(3)).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                guard.release().await.unwrap();
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(store.held("https://portal.example").await.unwrap(), 0);
}

#[tokio::test]
#[serial]
async fn slot_of_a_dead_holder_expires() {
    let store = store().await;
    let key = "ftp://archive.example";

    // a holder that never renews or releases
    assert!(store
        .try_acquire(key, "crashed-worker", 1, Duration::from_millis(300))
        .await
        .unwrap());
    assert!(!store
        .try_acquire(key, "live-worker", 1, Duration::from_secs(5))
        .await
        .unwrap());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store
        .try_acquire(key, "live-worker", 1, Duration::from_secs(5))
        .await
        .unwrap());
    store.release(key, "live-worker").await.unwrap();
    assert_eq!(store.held(key).await.unwrap(), 0);
}

#[tokio::test]
#[serial]
async fn renewal_keeps_a_held_slot() {
    let store = store().await;
    let key = "https://slow.example";
    assert!(store
        .try_acquire(key, "worker", 1, Duration::from_millis(300))
        .await
        .unwrap());

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.renew(key, "worker", Duration::from_millis(300)).await.unwrap());
    }
    assert_eq!(store.held(key).await.unwrap(), 1);

    store.release(key, "worker").await.unwrap();
    assert!(!store.renew(key, "worker", Duration::from_millis(300)).await.unwrap());
}
