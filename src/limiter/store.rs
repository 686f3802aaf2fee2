//! In-process slot store

use super::SlotStore;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Slot store kept in memory
///
/// Coordinates every limiter sharing the same instance, which makes it the store for
/// single-process deployments and for simulating several worker processes in tests.
/// Each operation runs under one lock, so it is atomic in the same sense as the
/// Redis scripts.
#[derive(Debug, Default)]
pub struct MemorySlotStore {
    slots: Mutex<HashMap<String, HashMap<String, Instant>>>,
}

impl MemorySlotStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live_slots<T>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, Instant>) -> T) -> T {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        let entry = slots.entry(key.to_string()).or_default();
        entry.retain(|_, expires_at| *expires_at > now);
        let result = f(entry);
        if entry.is_empty() {
            slots.remove(key);
        }
        result
    }
}

#[async_trait]
impl SlotStore for MemorySlotStore {
    async fn try_acquire(&self, key: &str, holder: &str, limit: u32, lease: Duration) -> Result<bool> {
        let expires_at = Instant::now() + lease;
        Ok(self.with_live_slots(key, |live| {
            if live.contains_key(holder) || live.len() < limit as usize {
                live.insert(holder.to_string(), expires_at);
                true
            } else {
                false
            }
        }))
    }

    async fn renew(&self, key: &str, holder: &str, lease: Duration) -> Result<bool> {
        let expires_at = Instant::now() + lease;
        Ok(self.with_live_slots(key, |live| match live.get_mut(holder) {
            Some(slot) => {
                *slot = expires_at;
                true
            }
            None => false,
        }))
    }

    async fn release(&self, key: &str, holder: &str) -> Result<()> {
        self.with_live_slots(key, |live| {
            live.remove(holder);
        });
        Ok(())
    }

    async fn held(&self, key: &str) -> Result<usize> {
        Ok(self.with_live_slots(key, |live| live.len()))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn admits_up_to_the_limit() {
        let store = MemorySlotStore::new();
        assert!(store.try_acquire("k", "a", 2, LEASE).await.unwrap());
        assert!(store.try_acquire("k", "b", 2, LEASE).await.unwrap());
        assert!(!store.try_acquire("k", "c", 2, LEASE).await.unwrap());
        // keys are independent
        assert!(store.try_acquire("other", "c", 2, LEASE).await.unwrap());

        store.release("k", "a").await.unwrap();
        assert!(store.try_acquire("k", "c", 2, LEASE).await.unwrap());
        assert_eq!(store.held("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reacquiring_by_the_same_holder_does_not_take_a_second_slot() {
        let store = MemorySlotStore::new();
        assert!(store.try_acquire("k", "a", 1, LEASE).await.unwrap());
        assert!(store.try_acquire("k", "a", 1, LEASE).await.unwrap());
        assert_eq!(store.held("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn releasing_an_unknown_holder_is_a_no_op() {
        let store = MemorySlotStore::new();
        store.release("k", "nobody").await.unwrap();
        assert_eq!(store.held("k").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_slots_are_purged_and_cannot_be_renewed() {
        let store = MemorySlotStore::new();
        assert!(store.try_acquire("k", "a", 1, LEASE).await.unwrap());
        assert!(store.renew("k", "a", LEASE).await.unwrap());

        tokio::time::advance(LEASE + Duration::from_secs(1)).await;
        assert_eq!(store.held("k").await.unwrap(), 0);
        assert!(!store.renew("k", "a", LEASE).await.unwrap());
        assert!(store.try_acquire("k", "b", 1, LEASE).await.unwrap());
    }
}
