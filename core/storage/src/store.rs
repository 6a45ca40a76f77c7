//! Key-value store trait definition.

use async_trait::async_trait;

use outbox_common::Result;

/// Persistent local key-value store.
///
/// Values are opaque strings; callers own their encoding. Implementations
/// must make a single `put` atomic: a reader sees either the old value or
/// the new one, never a torn write.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "file", "sqlite").
    fn name(&self) -> &str;

    /// Read the value stored under `key`.
    ///
    /// # Returns
    /// `Ok(None)` if the key has never been written or was removed.
    ///
    /// # Errors
    /// - Backend unavailable
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Postconditions
    /// - A subsequent `get(key)` returns `value`, including after a restart
    ///   for durable backends
    ///
    /// # Errors
    /// - Backend unavailable or write failed
    async fn put(&self, key: &str, value: String) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}
