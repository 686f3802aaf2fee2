//! Distributed per-provider download limiter
//!
//! A counting semaphore whose state lives in a shared store, so that the
//! `max_parallel_downloads` of a provider holds across every worker process that
//! points at the same store, not just within one process.
//!
//! Each held slot is an entry keyed by a random holder id with a lease expiry:
//! - acquisition is a single atomic operation in the store (purge expired entries,
//!   compare the count with the limit, insert)
//! - while a slot is held a background task renews its lease every third of the lease
//! - a process that dies while holding a slot stops renewing and the slot expires
//! - a renewal that finds the lease gone claims the slot again under the same holder
//!
//! Without a store, or for a provider without a limit, acquisition is a no-op and
//! touches nothing.

mod redis;
mod store;

pub use self::redis::RedisSlotStore;
pub use store::MemorySlotStore;

use crate::config::{LimiterConfig, StoreConfig};
use crate::error::{Error, Result};
use crate::retry::add_jitter;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Atomic slot bookkeeping in a shared store
///
/// Every method must be atomic on the store side: two processes calling
/// `try_acquire` at the same time must never both be admitted past `limit`.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Drop expired entries of `key`, then register `holder` if fewer than `limit`
    /// live entries remain. Returns whether the slot was granted. Re-acquiring a slot
    /// already held by `holder` succeeds and extends its lease.
    async fn try_acquire(&self, key: &str, holder: &str, limit: u32, lease: Duration) -> Result<bool>;

    /// Extend the lease of a held slot; `false` if it already expired
    async fn renew(&self, key: &str, holder: &str, lease: Duration) -> Result<bool>;

    /// Remove the slot of `holder` (no-op if it is gone)
    async fn release(&self, key: &str, holder: &str) -> Result<()>;

    /// Number of live slots under `key`
    async fn held(&self, key: &str) -> Result<usize>;
}

/// Fleet-wide download limiter
///
/// Cheap to clone. Either enabled (backed by a [`SlotStore`]) or disabled, in which
/// case every acquisition succeeds immediately; the choice is made once at startup.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    store: Option<Arc<dyn SlotStore>>,
    config: LimiterConfig,
    releases: TaskTracker,
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("enabled", &self.is_enabled())
            .field("config", &self.config)
            .finish()
    }
}

impl ConcurrencyLimiter {
    /// Limiter backed by `store`
    pub fn new(store: Arc<dyn SlotStore>, config: LimiterConfig) -> Self {
        Self {
            store: Some(store),
            config,
            releases: TaskTracker::new(),
        }
    }

    /// Limiter that admits everything without accounting
    pub fn disabled() -> Self {
        Self {
            store: None,
            config: LimiterConfig::default(),
            releases: TaskTracker::new(),
        }
    }

    /// Connect to the shared store, or fall back to the disabled limiter
    ///
    /// `None` (no store configured) and an unreachable store both produce a disabled
    /// limiter; the latter logs a warning.
    pub async fn connect(store: Option<StoreConfig>, config: LimiterConfig) -> Self {
        let Some(store_config) = store else {
            tracing::info!("no shared store configured, download limits are not enforced");
            return Self::disabled();
        };

        match RedisSlotStore::connect(&store_config).await {
            Ok(store) => {
                tracing::info!(
                    host = %store_config.host,
                    port = store_config.port,
                    "download limits enforced through shared store"
                );
                Self::new(Arc::new(store), config)
            }
            Err(e) => {
                tracing::warn!(
                    host = %store_config.host,
                    port = store_config.port,
                    error = %e,
                    "shared store unreachable, download limits are not enforced"
                );
                Self::disabled()
            }
        }
    }

    /// Whether slots are accounted in a store
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Timing settings
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Acquire a slot for `provider_key`, waiting up to the configured timeout
    pub async fn acquire(&self, provider_key: &str, limit: Option<u32>) -> Result<SlotGuard> {
        self.acquire_with_timeout(provider_key, limit, self.config.acquire_timeout)
            .await
    }

    /// Acquire a slot for `provider_key`, waiting up to `timeout`
    ///
    /// Polls the store with a doubling, jittered interval. Fails with
    /// [`Error::SlotUnavailable`] when the timeout elapses; never proceeds past the
    /// limit. `limit = None` returns a no-op guard without touching the store.
    pub async fn acquire_with_timeout(
        &self,
        provider_key: &str,
        limit: Option<u32>,
        timeout: Duration,
    ) -> Result<SlotGuard> {
        let (Some(store), Some(limit)) = (self.store.as_ref(), limit) else {
            return Ok(SlotGuard::noop(provider_key));
        };

        let holder = new_holder_id();
        let started = Instant::now();
        let deadline = started + timeout;
        let mut wait = self.config.poll_interval;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match store
                .try_acquire(provider_key, &holder, limit, self.config.lease)
                .await
            {
                Ok(true) => {
                    tracing::debug!(
                        provider = %provider_key,
                        holder = %holder,
                        attempts,
                        waited_ms = started.elapsed().as_millis(),
                        "download slot acquired"
                    );
                    return Ok(SlotGuard::held(
                        store.clone(),
                        provider_key,
                        holder,
                        limit,
                        self.config.lease,
                        self.releases.clone(),
                    ));
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(provider = %provider_key, error = %e, "slot acquisition attempt failed");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    provider = %provider_key,
                    limit,
                    attempts,
                    "timed out waiting for a download slot"
                );
                return Err(Error::SlotUnavailable {
                    provider: provider_key.to_string(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(add_jitter(wait).min(deadline - now)).await;
            wait = (wait * 2).min(self.config.max_poll_interval);
        }
    }

    /// Number of live slots for `provider_key` (0 when disabled)
    pub async fn held(&self, provider_key: &str) -> Result<usize> {
        match &self.store {
            Some(store) => store.held(provider_key).await,
            None => Ok(0),
        }
    }

    /// Wait for the releases of dropped guards to reach the store
    ///
    /// Guards dropped without [`SlotGuard::release`] (cancelled downloads) release
    /// their slot from a background task. Call this before the runtime shuts down so
    /// those slots are freed instead of being left to expire with their lease.
    pub async fn shutdown(&self) {
        self.releases.close();
        self.releases.wait().await;
        tracing::debug!("pending slot releases finished");
    }
}

fn new_holder_id() -> String {
    format!("{}-{:016x}", std::process::id(), rand::random::<u64>())
}

struct HeldSlot {
    store: Arc<dyn SlotStore>,
    holder: String,
    renewal: CancellationToken,
    releases: TaskTracker,
}

/// A held download slot
///
/// Release it with [`release`](Self::release). A guard that is dropped while still
/// held (error paths, cancelled tasks) releases the slot from a spawned task, and if
/// even that is impossible the lease runs out on its own.
pub struct SlotGuard {
    provider: String,
    slot: Option<HeldSlot>,
    overrun: Arc<AtomicBool>,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("provider", &self.provider)
            .field("is_noop", &self.is_noop())
            .field("overrun", &self.limit_overrun())
            .finish()
    }
}

impl SlotGuard {
    fn noop(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            slot: None,
            overrun: Arc::new(AtomicBool::new(false)),
        }
    }

    fn held(
        store: Arc<dyn SlotStore>,
        provider: &str,
        holder: String,
        limit: u32,
        lease: Duration,
        releases: TaskTracker,
    ) -> Self {
        let renewal = CancellationToken::new();
        let overrun = Arc::new(AtomicBool::new(false));
        tokio::spawn(renew_lease(
            Lease {
                store: store.clone(),
                provider: provider.to_string(),
                holder: holder.clone(),
                limit,
                duration: lease,
            },
            overrun.clone(),
            renewal.clone(),
        ));
        Self {
            provider: provider.to_string(),
            slot: Some(HeldSlot {
                store,
                holder,
                renewal,
                releases,
            }),
            overrun,
        }
    }

    /// Provider key the slot belongs to
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// True if no slot is actually held (unlimited provider or disabled limiter)
    pub fn is_noop(&self) -> bool {
        self.slot.is_none()
    }

    /// True if the lease lapsed and the slot could not be claimed back because other
    /// holders had filled the limit, so the transfer ran for a while uncounted
    pub fn limit_overrun(&self) -> bool {
        self.overrun.load(Ordering::Relaxed)
    }

    /// Release the slot
    pub async fn release(mut self) -> Result<()> {
        let Some(slot) = self.slot.take() else {
            return Ok(());
        };
        slot.renewal.cancel();
        slot.store.release(&self.provider, &slot.holder).await?;
        tracing::debug!(provider = %self.provider, holder = %slot.holder, "download slot released");
        Ok(())
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        slot.renewal.cancel();
        let provider = std::mem::take(&mut self.provider);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let releases = slot.releases.clone();
                let release = async move {
                    match slot.store.release(&provider, &slot.holder).await {
                        Ok(()) => tracing::debug!(
                            provider = %provider,
                            holder = %slot.holder,
                            "download slot released on drop"
                        ),
                        Err(e) => tracing::warn!(
                            provider = %provider,
                            error = %e,
                            "failed to release dropped slot, it will expire with its lease"
                        ),
                    }
                };
                releases.spawn_on(release, &handle);
            }
            Err(_) => {
                tracing::warn!(provider = %provider, "no runtime to release dropped slot, it will expire with its lease");
            }
        }
    }
}

struct Lease {
    store: Arc<dyn SlotStore>,
    provider: String,
    holder: String,
    limit: u32,
    duration: Duration,
}

impl Lease {
    /// Extend the lease, claiming the slot again if it lapsed
    async fn keep(&self, overrun: &AtomicBool, cancel: &CancellationToken) -> Result<()> {
        // a guard released meanwhile must not be claimed back
        if self.store.renew(&self.provider, &self.holder, self.duration).await? || cancel.is_cancelled() {
            return Ok(());
        }
        if self
            .store
            .try_acquire(&self.provider, &self.holder, self.limit, self.duration)
            .await?
        {
            tracing::warn!(
                provider = %self.provider,
                holder = %self.holder,
                "slot lease lapsed and was claimed back"
            );
        } else {
            overrun.store(true, Ordering::Relaxed);
            tracing::error!(
                provider = %self.provider,
                holder = %self.holder,
                limit = self.limit,
                "slot lease lapsed and the limit is full, transfer continues uncounted"
            );
        }
        Ok(())
    }
}

async fn renew_lease(lease: Lease, overrun: Arc<AtomicBool>, cancel: CancellationToken) {
    let period = (lease.duration / 3).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = lease.keep(&overrun, &cancel).await {
                    tracing::warn!(provider = %lease.provider, error = %e, "slot lease renewal failed");
                }
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> LimiterConfig {
        LimiterConfig {
            acquire_timeout: Duration::from_secs(5),
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(5),
            max_poll_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn disabled_limiter_admits_everything() {
        let limiter = ConcurrencyLimiter::disabled();
        assert!(!limiter.is_enabled());
        let guards: Vec<_> = futures::future::join_all(
            (0..10).map(|_| limiter.acquire("ftp://x", Some(1))),
        )
        .await;
        assert!(guards.iter().all(|g| g.as_ref().unwrap().is_noop()));
    }

    #[tokio::test]
    async fn unlimited_provider_never_touches_the_store() {
        let store = Arc::new(MemorySlotStore::new());
        let limiter = ConcurrencyLimiter::new(store.clone(), fast_config());
        let guard = limiter.acquire("https://open", None).await.unwrap();
        assert!(guard.is_noop());
        assert_eq!(store.held("https://open").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn acquire_times_out_instead_of_exceeding_the_limit() {
        let store = Arc::new(MemorySlotStore::new());
        let limiter = ConcurrencyLimiter::new(store.clone(), fast_config());
        let held = limiter.acquire("ftp://x", Some(1)).await.unwrap();

        let err = limiter
            .acquire_with_timeout("ftp://x", Some(1), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SlotUnavailable { ref provider, .. } if provider == "ftp://x"));
        assert_eq!(store.held("ftp://x").await.unwrap(), 1);

        held.release().await.unwrap();
        assert_eq!(store.held("ftp://x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let store = Arc::new(MemorySlotStore::new());
        let limiter = ConcurrencyLimiter::new(store.clone(), fast_config());
        let first = limiter.acquire("ftp://x", Some(1)).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire("ftp://x", Some(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        first.release().await.unwrap();
        let second = waiter.await.unwrap().unwrap();
        assert!(!second.is_noop());
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_guard_releases_its_slot() {
        let store = Arc::new(MemorySlotStore::new());
        let limiter = ConcurrencyLimiter::new(store.clone(), fast_config());
        drop(limiter.acquire("ftp://x", Some(1)).await.unwrap());

        let reacquired = limiter
            .acquire_with_timeout("ftp://x", Some(1), Duration::from_secs(1))
            .await
            .unwrap();
        reacquired.release().await.unwrap();
    }

    #[tokio::test]
    async fn simulated_processes_never_exceed_the_limit() {
        // independent limiters stand in for worker processes sharing one store
        let store = Arc::new(MemorySlotStore::new());
        let processes: Vec<_> = (0..4)
            .map(|_| ConcurrencyLimiter::new(store.clone(), fast_config()))
            .collect();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for (i, limiter) in processes.iter().enumerate() {
            for _ in 0..5 {
                let limiter = limiter.clone();
                let active = active.clone();
                let peak = peak.clone();
                tasks.push(tokio::spawn(async move {
                    let guard = limiter.acquire("ftp://x", Some(3)).await.unwrap();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5 + i as u64)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    guard.release().await.unwrap();
                }));
            }
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
        assert_eq!(store.held("ftp://x").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn held_slot_is_kept_alive_by_renewal() {
        let store = Arc::new(MemorySlotStore::new());
        let config = LimiterConfig {
            lease: Duration::from_secs(3),
            ..fast_config()
        };
        let limiter = ConcurrencyLimiter::new(store.clone(), config);
        let guard = limiter.acquire("ftp://x", Some(1)).await.unwrap();

        // several leases worth of time
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.held("ftp://x").await.unwrap(), 1);

        guard.release().await.unwrap();
        assert_eq!(store.held("ftp://x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_releases_of_dropped_guards() {
        let store = Arc::new(MemorySlotStore::new());
        let limiter = ConcurrencyLimiter::new(store.clone(), fast_config());
        let first = limiter.acquire("ftp://x", Some(2)).await.unwrap();
        let second = limiter.acquire("ftp://x", Some(2)).await.unwrap();
        assert_eq!(store.held("ftp://x").await.unwrap(), 2);

        // as when a download future is abandoned
        drop(first);
        drop(second);
        limiter.shutdown().await;
        assert_eq!(store.held("ftp://x").await.unwrap(), 0);
    }

    /// Store whose renewals always find the lease gone, optionally after another
    /// holder has filled the limit
    struct LapsingStore {
        inner: MemorySlotStore,
        intruder: bool,
    }

    #[async_trait]
    impl SlotStore for LapsingStore {
        async fn try_acquire(&self, key: &str, holder: &str, limit: u32, lease: Duration) -> Result<bool> {
            self.inner.try_acquire(key, holder, limit, lease).await
        }

        async fn renew(&self, key: &str, holder: &str, lease: Duration) -> Result<bool> {
            self.inner.release(key, holder).await?;
            if self.intruder {
                self.inner.try_acquire(key, "intruder", 1, lease).await?;
            }
            Ok(false)
        }

        async fn release(&self, key: &str, holder: &str) -> Result<()> {
            self.inner.release(key, holder).await
        }

        async fn held(&self, key: &str) -> Result<usize> {
            self.inner.held(key).await
        }
    }

    fn lapsing_limiter(intruder: bool) -> (Arc<LapsingStore>, ConcurrencyLimiter) {
        let store = Arc::new(LapsingStore {
            inner: MemorySlotStore::new(),
            intruder,
        });
        let config = LimiterConfig {
            lease: Duration::from_secs(3),
            ..fast_config()
        };
        (store.clone(), ConcurrencyLimiter::new(store, config))
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_lease_is_claimed_back() {
        let (store, limiter) = lapsing_limiter(false);
        let guard = limiter.acquire("ftp://x", Some(1)).await.unwrap();

        // past the first renewal
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.held("ftp://x").await.unwrap(), 1);
        assert!(!guard.limit_overrun());

        guard.release().await.unwrap();
        assert_eq!(store.held("ftp://x").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_lease_taken_by_another_holder_is_reported() {
        let (store, limiter) = lapsing_limiter(true);
        let guard = limiter.acquire("ftp://x", Some(1)).await.unwrap();
        assert!(!guard.limit_overrun());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(guard.limit_overrun());
        assert!(format!("{guard:?}").contains("overrun: true"));
        // the other holder keeps its slot
        guard.release().await.unwrap();
        assert_eq!(store.held("ftp://x").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_slot_expires_with_its_lease() {
        let store = Arc::new(MemorySlotStore::new());
        let lease = Duration::from_secs(3);
        // a crashed process: acquired in the store, never renewed, never released
        assert!(store.try_acquire("ftp://x", "dead", 1, lease).await.unwrap());

        let limiter = ConcurrencyLimiter::new(store.clone(), fast_config());
        let started = Instant::now();
        let guard = limiter
            .acquire_with_timeout("ftp://x", Some(1), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(started.elapsed() >= lease);
        guard.release().await.unwrap();
    }
}
