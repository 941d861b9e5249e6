//! Named, TTL-bounded mutual exclusion built on [`KeyValueStore::set_if_absent`].
//!
//! A holder writes a random token under `lock:{name}`; release deletes the key only while it
//! still carries that token, so a holder whose lease expired cannot free somebody else's lock.

use std::sync::Arc;

use tokio::time::{Instant, sleep};
use tracing::debug;
use uuid::Uuid;

use crate::{
    config::LockSettings,
    dao::{kv_store::KeyValueStore, storage::StorageResult},
};

/// Named mutual exclusion on top of the shared store.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    settings: LockSettings,
}

/// Proof of ownership for a held lock. Must be released explicitly; otherwise the lease
/// simply runs out after the hold timeout.
#[must_use = "a lock guard must be released"]
pub struct LockGuard {
    store: Arc<dyn KeyValueStore>,
    key: String,
    token: String,
    acquired_at: Instant,
}

impl DistributedLock {
    /// Lock factory over `store`, tuned by `settings`.
    pub fn new(store: Arc<dyn KeyValueStore>, settings: LockSettings) -> Self {
        Self { store, settings }
    }

    /// Timing the lock was built with.
    pub fn settings(&self) -> LockSettings {
        self.settings
    }

    /// Try to take `name`, retrying a bounded number of times with a growing pause.
    ///
    /// Returns `Ok(None)` when the wait budget is exhausted.
    pub async fn try_acquire(&self, name: &str) -> StorageResult<Option<LockGuard>> {
        let key = format!("lock:{name}");
        let token = Uuid::new_v4().simple().to_string();
        let started = Instant::now();
        let deadline = started + self.settings.wait;
        let mut pause = self.settings.backoff;

        for attempt in 1..=self.settings.attempts.max(1) {
            if self
                .store
                .set_if_absent(&key, token.clone(), self.settings.hold)
                .await?
            {
                return Ok(Some(LockGuard {
                    store: self.store.clone(),
                    key,
                    token,
                    acquired_at: Instant::now(),
                }));
            }

            let now = Instant::now();
            if now >= deadline || attempt == self.settings.attempts {
                break;
            }
            debug!(lock = %key, attempt, "lock contended; backing off");
            sleep(pause.min(deadline - now)).await;
            pause += self.settings.backoff;
        }

        debug!(lock = %key, waited_ms = started.elapsed().as_millis() as u64, "lock not acquired");
        Ok(None)
    }
}

impl LockGuard {
    /// Time elapsed since the lock was taken.
    pub fn held_for(&self) -> std::time::Duration {
        self.acquired_at.elapsed()
    }

    /// Release the lock. Returns `false` when the lease had already expired.
    pub async fn release(self) -> StorageResult<bool> {
        self.store.delete_if_equals(&self.key, &self.token).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dao::kv_store::memory::MemoryStore;

    fn lock(settings: LockSettings) -> DistributedLock {
        DistributedLock::new(Arc::new(MemoryStore::new()), settings)
    }

    #[tokio::test(start_paused = true)]
    async fn second_holder_is_rejected_until_release() {
        let lock = lock(LockSettings {
            wait: Duration::from_millis(200),
            hold: Duration::from_secs(5),
            attempts: 3,
            backoff: Duration::from_millis(20),
        });

        let guard = lock.try_acquire("room:a").await.unwrap().unwrap();
        assert!(lock.try_acquire("room:a").await.unwrap().is_none());
        assert!(lock.try_acquire("room:b").await.unwrap().is_some());

        assert!(guard.release().await.unwrap());
        assert!(lock.try_acquire("room:a").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_can_be_taken_over() {
        let lock = lock(LockSettings {
            wait: Duration::from_millis(100),
            hold: Duration::from_secs(1),
            attempts: 2,
            backoff: Duration::from_millis(10),
        });

        let stale = lock.try_acquire("room:a").await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = lock.try_acquire("room:a").await.unwrap().unwrap();

        // The stale holder must not free the new lease.
        assert!(!stale.release().await.unwrap());
        assert!(lock.try_acquire("room:a").await.unwrap().is_none());
        assert!(fresh.release().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_lock_released_during_backoff() {
        let lock = lock(LockSettings {
            wait: Duration::from_millis(500),
            hold: Duration::from_secs(5),
            attempts: 5,
            backoff: Duration::from_millis(50),
        });

        let guard = lock.try_acquire("room:a").await.unwrap().unwrap();
        let contender = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.try_acquire("room:a").await })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        guard.release().await.unwrap();

        assert!(contender.await.unwrap().unwrap().is_some());
    }
}
