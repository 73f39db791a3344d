//! Store adapter (L3): durable, instance-aware storage behind a narrow trait.
//!
//! Every operation names its instance explicitly -- the store is the one
//! layer that sees the composite identity `(instance_id, key)` directly
//! rather than a flattened namespaced key. Upserts apply the last-write-wins
//! guard: a write whose timestamp is older than the stored row's
//! `updated_at` is ignored, so replicas can forward racing writes in any
//! order and converge on the same durable value.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use warren_core::CacheEntry;

use crate::error::StoreError;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Durable, instance-aware key-value storage.
///
/// Shared as `Arc<dyn InstanceStore>`. Implementations must be safe for
/// concurrent use and must never return expired entries from any read path.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Fetches the live entry for `(instance_id, key)`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when absent or expired (an expired row may be
    /// deleted opportunistically during the read); backend errors otherwise.
    async fn get(&self, instance_id: &str, key: &str) -> Result<CacheEntry, StoreError>;

    /// Upserts a value with the LWW guard.
    ///
    /// On conflict the row's `version` is bumped and `updated_at` becomes
    /// `write_time` -- unless `write_time` is older than the stored
    /// `updated_at`, in which case the write is silently ignored (equal
    /// timestamps: arrival order wins). Payloads that are not valid JSON are
    /// wrapped as a JSON string; a warning is logged and the write proceeds.
    async fn set(
        &self,
        instance_id: &str,
        key: &str,
        value: &[u8],
        write_time: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Removes one entry. Deleting an absent entry is not an error.
    async fn delete(&self, instance_id: &str, key: &str) -> Result<(), StoreError>;

    /// Whether a live entry exists.
    async fn exists(&self, instance_id: &str, key: &str) -> Result<bool, StoreError>;

    /// Fetches many entries; missing or expired keys are absent from the map.
    async fn batch_get(
        &self,
        instance_id: &str,
        keys: &[String],
    ) -> Result<HashMap<String, CacheEntry>, StoreError>;

    /// Pages through every `(instance_id, key)` pair, ordered
    /// deterministically.
    async fn get_all_keys(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<(String, String)>, StoreError>;

    /// Pages through one instance's keys, ordered deterministically.
    async fn get_keys_by_instance(
        &self,
        instance_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<String>, StoreError>;

    /// Removes every entry of one instance, returning the count.
    async fn delete_by_instance(&self, instance_id: &str) -> Result<u64, StoreError>;

    /// Removes up to `batch` expired entries, returning the count.
    async fn cleanup_expired(&self, batch: u64) -> Result<u64, StoreError>;

    /// Upsert with optimistic concurrency: succeeds only when the current
    /// version equals `expected_version`, returning the new version.
    ///
    /// # Errors
    ///
    /// [`StoreError::VersionMismatch`] on a stale expectation;
    /// [`StoreError::NotFound`] when the entry does not exist.
    async fn set_with_version(
        &self,
        instance_id: &str,
        key: &str,
        value: &[u8],
        expected_version: i64,
    ) -> Result<i64, StoreError>;

    /// Upserts a batch of fully-formed entries atomically (all or nothing).
    ///
    /// Used by restore: entries are written exactly as given (version, ttl,
    /// metadata, timestamps), keyed under `instance_id`.
    async fn put_entries(
        &self,
        instance_id: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<u64, StoreError>;
}

/// Parses raw payload bytes into the JSON value stored durably.
///
/// Non-JSON payloads are wrapped as a JSON string (lossily decoded as UTF-8)
/// with a logged warning, per the corruption-handling contract.
#[must_use]
pub fn normalize_value(instance_id: &str, key: &str, raw: &[u8]) -> serde_json::Value {
    match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(
                instance_id,
                key,
                error = %err,
                "payload is not valid JSON; wrapping as string",
            );
            serde_json::Value::String(String::from_utf8_lossy(raw).into_owned())
        }
    }
}
