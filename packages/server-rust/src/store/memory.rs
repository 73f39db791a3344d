//! In-memory [`InstanceStore`] backed by [`DashMap`].
//!
//! The default durable-store stand-in for development and tests. Implements
//! the full contract -- LWW upsert guard, version bumps, expiry-aware reads,
//! deterministic pagination -- so handler and lifecycle tests exercise real
//! semantics without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use warren_core::CacheEntry;

use crate::error::StoreError;
use crate::store::{normalize_value, InstanceStore};

/// Concurrent in-memory store keyed by `(instance_id, key)`.
pub struct MemoryStore {
    entries: DashMap<(String, String), CacheEntry>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Total number of rows, expired ones included. Test helper.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no rows at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn composite(instance_id: &str, key: &str) -> (String, String) {
        (instance_id.to_string(), key.to_string())
    }

    fn live_entry(&self, instance_id: &str, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let composite = Self::composite(instance_id, key);
        match self.entries.get(&composite) {
            Some(entry) if !entry.is_expired(now) => Some(entry.clone()),
            Some(_) => {
                // Opportunistic removal of the expired row.
                drop(self.entries.remove(&composite));
                None
            }
            None => None,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn get(&self, instance_id: &str, key: &str) -> Result<CacheEntry, StoreError> {
        self.live_entry(instance_id, key, Utc::now())
            .ok_or_else(|| StoreError::NotFound {
                instance_id: instance_id.to_string(),
                key: key.to_string(),
            })
    }

    async fn set(
        &self,
        instance_id: &str,
        key: &str,
        value: &[u8],
        write_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let value = normalize_value(instance_id, key, value);
        let composite = Self::composite(instance_id, key);

        match self.entries.entry(composite) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                // LWW guard: an older write never overwrites a newer row.
                // Equal timestamps fall through, so arrival order wins.
                if write_time < existing.updated_at {
                    tracing::debug!(
                        instance_id,
                        key,
                        incoming = %write_time,
                        stored = %existing.updated_at,
                        "ignoring stale write",
                    );
                    return Ok(());
                }
                existing.value = value;
                existing.version += 1;
                existing.updated_at = write_time;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(instance_id, key, value, write_time));
            }
        }
        Ok(())
    }

    async fn delete(&self, instance_id: &str, key: &str) -> Result<(), StoreError> {
        self.entries.remove(&Self::composite(instance_id, key));
        Ok(())
    }

    async fn exists(&self, instance_id: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.live_entry(instance_id, key, Utc::now()).is_some())
    }

    async fn batch_get(
        &self,
        instance_id: &str,
        keys: &[String],
    ) -> Result<HashMap<String, CacheEntry>, StoreError> {
        let now = Utc::now();
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.live_entry(instance_id, key, now) {
                found.insert(key.clone(), entry);
            }
        }
        Ok(found)
    }

    async fn get_all_keys(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let mut keys: Vec<(String, String)> =
            self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort_unstable();
        Ok(page(keys, offset, limit))
    }

    async fn get_keys_by_instance(
        &self,
        instance_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == instance_id)
            .map(|e| e.key().1.clone())
            .collect();
        keys.sort_unstable();
        Ok(page(keys, offset, limit))
    }

    async fn delete_by_instance(&self, instance_id: &str) -> Result<u64, StoreError> {
        let before = self.entries.len();
        self.entries.retain(|(owner, _), _| owner != instance_id);
        Ok((before - self.entries.len()) as u64)
    }

    async fn cleanup_expired(&self, batch: u64) -> Result<u64, StoreError> {
        let now = Utc::now();
        let doomed: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.key().clone())
            .take(usize::try_from(batch).unwrap_or(usize::MAX))
            .collect();

        let mut removed = 0;
        for composite in doomed {
            if self.entries.remove(&composite).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn set_with_version(
        &self,
        instance_id: &str,
        key: &str,
        value: &[u8],
        expected_version: i64,
    ) -> Result<i64, StoreError> {
        let value = normalize_value(instance_id, key, value);
        let composite = Self::composite(instance_id, key);

        match self.entries.entry(composite) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                if existing.version != expected_version {
                    return Err(StoreError::VersionMismatch {
                        key: key.to_string(),
                        expected: expected_version,
                        actual: existing.version,
                    });
                }
                existing.value = value;
                existing.version += 1;
                existing.updated_at = Utc::now();
                Ok(existing.version)
            }
            Entry::Vacant(_) => Err(StoreError::NotFound {
                instance_id: instance_id.to_string(),
                key: key.to_string(),
            }),
        }
    }

    async fn put_entries(
        &self,
        instance_id: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<u64, StoreError> {
        // Validate the whole batch before touching the map, so a bad record
        // rolls back the entire import.
        for entry in &entries {
            if entry.key.is_empty() {
                return Err(StoreError::Backend(format!(
                    "restore batch for {instance_id} contains an entry with an empty key"
                )));
            }
        }

        let count = entries.len() as u64;
        for mut entry in entries {
            entry.instance_id = instance_id.to_string();
            self.entries
                .insert(Self::composite(instance_id, &entry.key), entry);
        }
        Ok(count)
    }
}

fn page<T>(items: Vec<T>, offset: u64, limit: u64) -> Vec<T> {
    items
        .into_iter()
        .skip(usize::try_from(offset).unwrap_or(usize::MAX))
        .take(usize::try_from(limit).unwrap_or(usize::MAX))
        .collect()
}
