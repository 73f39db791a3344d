//! The [`CacheBackend`] trait: the narrow interface the core uses to talk to
//! any KV-with-TTL engine.
//!
//! Implementations must be safe for concurrent use; the core shares them as
//! `Arc<dyn CacheBackend>`. Keys arriving here are already namespaced by the
//! key builder -- the backend never interprets key structure, with the single
//! exception of the optional [`scan`](CacheBackend::scan) capability.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CacheError;

/// Narrow interface over a key-value store with per-key TTL.
///
/// `ttl = Duration::ZERO` means "use the backend's default TTL". Single-key
/// `get` distinguishes absence ([`CacheError::KeyNotFound`]) from backend
/// failure; multi-key reads simply omit missing keys from the result map.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetches one value.
    ///
    /// # Errors
    ///
    /// [`CacheError::KeyNotFound`] when absent or expired; backend errors
    /// otherwise.
    async fn get(&self, key: &str) -> Result<Bytes, CacheError>;

    /// Stores one value. `ttl = ZERO` applies the backend default.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    /// Removes one key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Whether a live (non-expired) value exists for the key.
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Fetches many values. Missing keys are absent from the result map.
    async fn get_multiple(&self, keys: &[String]) -> Result<HashMap<String, Bytes>, CacheError>;

    /// Stores many values under one TTL policy.
    async fn set_multiple(
        &self,
        entries: &[(String, Bytes)],
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Removes many keys.
    async fn delete_multiple(&self, keys: &[String]) -> Result<(), CacheError>;

    /// Resets the TTL of an existing key without rewriting its value.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Lists keys matching a glob-tail pattern (`prefix*`).
    ///
    /// Optional capability: the default implementation reports
    /// [`CacheError::Unsupported`], and dependents (registry list, cleanup,
    /// cache scan-delete) degrade gracefully when they see it.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let _ = pattern;
        Err(CacheError::Unsupported("scan"))
    }

    /// Liveness check against the backend.
    async fn ping(&self) -> Result<(), CacheError>;

    /// Releases backend resources. Operations after close fail with
    /// [`CacheError::Closed`].
    async fn close(&self) -> Result<(), CacheError>;
}
