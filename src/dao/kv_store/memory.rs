//! Process-local [`KeyValueStore`] with lazy TTL expiry.
//!
//! Expiry is measured with [`tokio::time::Instant`] so paused-clock tests can fast-forward
//! through room lifetimes.

use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::{FutureExt, future::BoxFuture};
use tokio::time::Instant;
use tracing::debug;

use crate::dao::{kv_store::KeyValueStore, storage::StorageResult};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// Process-local store with lazy expiry. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredValue>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read_live(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Some(entry.value.clone());
            }
        }
        // Expired entries are dropped on access.
        if self
            .entries
            .remove_if(key, |_, stored| !stored.is_live(now))
            .is_some()
        {
            debug!(key, "expired key evicted");
        }
        None
    }

    /// Remove every expired entry, returning how many were evicted.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.is_live(now));
        before.saturating_sub(self.entries.len())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> BoxFuture<'static, StorageResult<Option<String>>> {
        let value = self.read_live(key);
        async move { Ok(value) }.boxed()
    }

    fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        async move { Ok(()) }.boxed()
    }

    fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let now = Instant::now();
        let written = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    false
                } else {
                    occupied.insert(StoredValue::new(value, Some(ttl)));
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, Some(ttl)));
                true
            }
        };
        async move { Ok(written) }.boxed()
    }

    fn delete(&self, key: &str) -> BoxFuture<'static, StorageResult<bool>> {
        let now = Instant::now();
        let removed = self
            .entries
            .remove(key)
            .is_some_and(|(_, stored)| stored.is_live(now));
        async move { Ok(removed) }.boxed()
    }

    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let now = Instant::now();
        let removed = self
            .entries
            .remove_if(key, |_, stored| {
                stored.is_live(now) && stored.value == expected
            })
            .is_some();
        async move { Ok(removed) }.boxed()
    }

    fn expire(&self, key: &str, ttl: Duration) -> BoxFuture<'static, StorageResult<bool>> {
        let now = Instant::now();
        let refreshed = match self.entries.get_mut(key) {
            Some(mut stored) if stored.is_live(now) => {
                stored.expires_at = Some(now + ttl);
                true
            }
            _ => false,
        };
        async move { Ok(refreshed) }.boxed()
    }

    fn exists(&self, key: &str) -> BoxFuture<'static, StorageResult<bool>> {
        let present = self.read_live(key).is_some();
        async move { Ok(present) }.boxed()
    }

    fn scan_prefix(&self, prefix: &str) -> BoxFuture<'static, StorageResult<Vec<(String, String)>>> {
        let now = Instant::now();
        let matches = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect::<Vec<_>>();
        async move { Ok(matches) }.boxed()
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        async move { Ok(()) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn values_expire_after_ttl() {
        let store = MemoryStore::new();
        store
            .set("room:a", "blob".into(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(store.get("room:a").await.unwrap().as_deref(), Some("blob"));

        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(store.get("room:a").await.unwrap().is_none());
        assert!(!store.exists("room:a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expire_extends_lifetime() {
        let store = MemoryStore::new();
        store
            .set("k", "v".into(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.expire("k", Duration::from_secs(5)).await.unwrap());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.exists("k").await.unwrap());
        assert!(!store.expire("missing", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_respects_live_values_only() {
        let store = MemoryStore::new();
        assert!(
            store
                .set_if_absent("lock", "a".into(), Duration::from_secs(1))
                .await
                .unwrap()
        );
        assert!(
            !store
                .set_if_absent("lock", "b".into(), Duration::from_secs(1))
                .await
                .unwrap()
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(
            store
                .set_if_absent("lock", "b".into(), Duration::from_secs(1))
                .await
                .unwrap()
        );
        assert!(!store.delete_if_equals("lock", "a").await.unwrap());
        assert!(store.delete_if_equals("lock", "b").await.unwrap());
    }

    #[tokio::test]
    async fn scan_prefix_only_returns_matching_keys() {
        let store = MemoryStore::new();
        store.set("room:1:votes:a", "1".into(), None).await.unwrap();
        store.set("room:1:votes:b", "2".into(), None).await.unwrap();
        store.set("room:2:votes:a", "3".into(), None).await.unwrap();

        let mut keys = store
            .scan_prefix("room:1:votes:")
            .await
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
        keys.sort();
        assert_eq!(keys, vec!["room:1:votes:a", "room:1:votes:b"]);
    }
}
