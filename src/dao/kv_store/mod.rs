/// In-process backend.
pub mod memory;

use std::time::Duration;

use futures::future::BoxFuture;

use crate::dao::storage::StorageResult;

/// Abstraction over the shared, TTL-capable key/value store holding room and session state.
///
/// Values are opaque strings; typed encoding lives in the room store. Every method returns an
/// owned future so implementations can be shared behind an `Arc` across tasks.
pub trait KeyValueStore: Send + Sync {
    /// Live value of `key`, or `None` when absent or expired.
    fn get(&self, key: &str) -> BoxFuture<'static, StorageResult<Option<String>>>;
    /// Overwrite `key`. `None` keeps the value until it is deleted.
    fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Write `key` only when it holds no live value. Returns whether the write happened.
    fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    /// Remove `key`, returning whether a live value was removed.
    fn delete(&self, key: &str) -> BoxFuture<'static, StorageResult<bool>>;
    /// Remove `key` only while it still holds `expected`.
    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    /// Reset the expiry of an existing key. Returns `false` when the key is absent.
    fn expire(&self, key: &str, ttl: Duration) -> BoxFuture<'static, StorageResult<bool>>;
    /// Whether `key` holds a live value.
    fn exists(&self, key: &str) -> BoxFuture<'static, StorageResult<bool>>;
    /// Every live key/value pair whose key starts with `prefix`.
    fn scan_prefix(&self, prefix: &str) -> BoxFuture<'static, StorageResult<Vec<(String, String)>>>;
    /// Cheap round trip proving the backend answers.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
}
