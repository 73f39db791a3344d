//! Instance registry (M1) -- the system of record for instance records.
//!
//! Records are durable in the KV backend under `registry:instance:{id}`
//! (24-hour TTL, refreshed on read) and fronted by an in-memory map for
//! low-latency resolution on every request. The memory cache stores clones
//! and hands out clones, so callers can never corrupt cached state.
//!
//! Activity updates are throttled per instance: no matter how many requests
//! arrive, `update_last_active` rewrites the record at most once per
//! [`RegistryConfig::activity_interval`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};
use warren_core::{InstanceRecord, InstanceStatus};

use crate::cache::CacheBackend;
use crate::error::{CacheError, RegistryError};

/// Backing-store key prefix for instance records.
pub const REGISTRY_KEY_PREFIX: &str = "registry:instance:";

/// Tuning knobs for the registry's durability and caching behavior.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// TTL applied to records in the backing store. Refreshed on every read,
    /// so an instance only falls out after this much total silence.
    pub record_ttl: Duration,
    /// How long a memory-cache entry is trusted before re-reading the
    /// backing store.
    pub memory_ttl: Duration,
    /// Minimum spacing between `last_active` rewrites per instance.
    pub activity_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(24 * 3600),
            memory_ttl: Duration::from_secs(5 * 60),
            activity_interval: Duration::from_secs(60),
        }
    }
}

/// Optional `list` filters; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub status: Option<InstanceStatus>,
    pub region: Option<String>,
    pub game_type: Option<String>,
}

impl InstanceFilter {
    fn matches(&self, record: &InstanceRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self.region.as_deref().is_none_or(|r| record.region == r)
            && self
                .game_type
                .as_deref()
                .is_none_or(|g| record.game_type == g)
    }
}

struct CachedRecord {
    record: InstanceRecord,
    cached_at: Instant,
}

/// The registry. Long-lived singleton, shared as `Arc<InstanceRegistry>`.
pub struct InstanceRegistry {
    backend: Arc<dyn CacheBackend>,
    config: RegistryConfig,
    memory: RwLock<HashMap<String, CachedRecord>>,
    activity: RwLock<HashMap<String, Instant>>,
}

fn registry_key(instance_id: &str) -> String {
    format!("{REGISTRY_KEY_PREFIX}{instance_id}")
}

fn backend_err(err: CacheError) -> RegistryError {
    RegistryError::Backend(err.to_string())
}

impl InstanceRegistry {
    /// Creates a registry over the given backing store.
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>, config: RegistryConfig) -> Self {
        Self {
            backend,
            config,
            memory: RwLock::new(HashMap::new()),
            activity: RwLock::new(HashMap::new()),
        }
    }

    /// Validates and writes a record to the backing store, then updates the
    /// memory cache.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Invalid`] on invariant violations,
    /// [`RegistryError::Serialization`] on encode failures (fatal for the
    /// request), or a backend error. The memory cache is never updated on
    /// failure.
    pub async fn register(&self, record: &InstanceRecord) -> Result<(), RegistryError> {
        record
            .validate()
            .map_err(|err| RegistryError::Invalid(err.to_string()))?;

        let payload = Bytes::from(serde_json::to_vec(record)?);
        self.backend
            .set(&registry_key(&record.instance_id), payload, self.config.record_ttl)
            .await
            .map_err(backend_err)?;

        self.memory.write().insert(
            record.instance_id.clone(),
            CachedRecord {
                record: record.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Resolves a record: memory cache first, then the backing store.
    ///
    /// A backing-store hit refreshes the store TTL on a detached task and
    /// repopulates the memory cache. Returns a clone; mutating it does not
    /// affect registry state.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] when the id is unknown.
    pub async fn get(&self, instance_id: &str) -> Result<InstanceRecord, RegistryError> {
        if let Some(cached) = self.memory.read().get(instance_id) {
            if cached.cached_at.elapsed() < self.config.memory_ttl {
                return Ok(cached.record.clone());
            }
        }

        let key = registry_key(instance_id);
        let raw = match self.backend.get(&key).await {
            Ok(raw) => raw,
            Err(CacheError::KeyNotFound(_)) => {
                return Err(RegistryError::NotFound(instance_id.to_string()));
            }
            Err(err) => return Err(backend_err(err)),
        };
        let record: InstanceRecord = serde_json::from_slice(&raw)?;

        // Keep the durable record alive without blocking this request.
        let backend = Arc::clone(&self.backend);
        let ttl = self.config.record_ttl;
        tokio::spawn(async move {
            if let Err(err) = backend.expire(&key, ttl).await {
                debug!(key, error = %err, "registry TTL refresh failed");
            }
        });

        self.memory.write().insert(
            instance_id.to_string(),
            CachedRecord {
                record: record.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(record)
    }

    /// Returns the existing record, or creates one with defaults (status
    /// `active`, default quotas) on first reference.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Invalid`] for an empty id; backend and serialization
    /// errors otherwise.
    pub async fn get_or_create(&self, instance_id: &str) -> Result<InstanceRecord, RegistryError> {
        let id = instance_id.trim();
        if id.is_empty() {
            return Err(RegistryError::Invalid(
                "instance_id must not be empty".to_string(),
            ));
        }

        match self.get(id).await {
            Ok(record) => Ok(record),
            Err(RegistryError::NotFound(_)) => {
                let record = InstanceRecord::new(id, Utc::now());
                self.register(&record).await?;
                debug!(instance_id = id, "created instance record");
                Ok(record)
            }
            Err(err) => Err(err),
        }
    }

    /// Rewrites a record, preserving the stored `created_at`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] when the id has no existing record.
    pub async fn update(&self, record: &InstanceRecord) -> Result<(), RegistryError> {
        let existing = self.get(&record.instance_id).await?;

        let mut updated = record.clone();
        updated.created_at = existing.created_at;
        if updated.last_active < updated.created_at {
            updated.last_active = updated.created_at;
        }
        self.register(&updated).await
    }

    /// Removes a record from the backing store, the memory cache, and the
    /// activity throttle.
    pub async fn delete(&self, instance_id: &str) -> Result<(), RegistryError> {
        self.backend
            .delete(&registry_key(instance_id))
            .await
            .map_err(backend_err)?;
        self.memory.write().remove(instance_id);
        self.activity.write().remove(instance_id);
        Ok(())
    }

    /// Stamps `last_active = now`, throttled to once per
    /// [`RegistryConfig::activity_interval`] per instance.
    ///
    /// Returns `true` when a rewrite actually happened. Best-effort: callers
    /// fire-and-forget this.
    pub async fn update_last_active(&self, instance_id: &str) -> Result<bool, RegistryError> {
        {
            let activity = self.activity.read();
            if let Some(last) = activity.get(instance_id) {
                if last.elapsed() < self.config.activity_interval {
                    return Ok(false);
                }
            }
        }
        {
            // Re-check under the write lock so concurrent callers collapse
            // into a single rewrite per interval.
            let mut activity = self.activity.write();
            if let Some(last) = activity.get(instance_id) {
                if last.elapsed() < self.config.activity_interval {
                    return Ok(false);
                }
            }
            activity.insert(instance_id.to_string(), Instant::now());
        }

        let mut record = self.get(instance_id).await?;
        record.touch(Utc::now());
        self.register(&record).await?;
        Ok(true)
    }

    /// Lists all records matching the filter.
    ///
    /// Requires the backend's `scan` capability; without it the result is an
    /// empty list and dependents (cleanup) degrade to a no-op.
    pub async fn list(&self, filter: &InstanceFilter) -> Result<Vec<InstanceRecord>, RegistryError> {
        let keys = match self.backend.scan(&format!("{REGISTRY_KEY_PREFIX}*")).await {
            Ok(keys) => keys,
            Err(CacheError::Unsupported(_)) => {
                debug!("registry backend cannot scan; list returns empty");
                return Ok(Vec::new());
            }
            Err(err) => return Err(backend_err(err)),
        };

        let found = self
            .backend
            .get_multiple(&keys)
            .await
            .map_err(backend_err)?;

        let mut records = Vec::with_capacity(found.len());
        for (key, raw) in found {
            match serde_json::from_slice::<InstanceRecord>(&raw) {
                Ok(record) if filter.matches(&record) => records.push(record),
                Ok(_) => {}
                Err(err) => warn!(key, error = %err, "skipping undecodable registry record"),
            }
        }
        records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::cache::MemoryCache;

    fn registry() -> (Arc<MemoryCache>, InstanceRegistry) {
        let backend = Arc::new(MemoryCache::new());
        let reg = InstanceRegistry::new(backend.clone(), RegistryConfig::default());
        (backend, reg)
    }

    #[tokio::test]
    async fn register_and_get_round_trip() {
        let (_, reg) = registry();
        let record = InstanceRecord::new("tenant-a", Utc::now());
        reg.register(&record).await.unwrap();

        let fetched = reg.get("tenant-a").await.unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn register_rejects_invalid_records() {
        let (_, reg) = registry();
        let record = InstanceRecord::new("", Utc::now());
        assert!(matches!(
            reg.register(&record).await,
            Err(RegistryError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn get_unknown_id_is_not_found() {
        let (_, reg) = registry();
        assert!(matches!(
            reg.get("ghost").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn get_serves_from_memory_after_backend_loss() {
        let (backend, reg) = registry();
        let record = InstanceRecord::new("tenant-a", Utc::now());
        reg.register(&record).await.unwrap();

        // Simulate the backing store losing the record; the memory cache
        // still answers within its TTL.
        backend.clear();
        assert!(reg.get("tenant-a").await.is_ok());
    }

    #[tokio::test]
    async fn returned_records_are_clones() {
        let (_, reg) = registry();
        reg.register(&InstanceRecord::new("tenant-a", Utc::now()))
            .await
            .unwrap();

        let mut first = reg.get("tenant-a").await.unwrap();
        first.status = InstanceStatus::Paused;
        first.metadata.insert("x".to_string(), "y".to_string());

        let second = reg.get("tenant-a").await.unwrap();
        assert_eq!(second.status, InstanceStatus::Active);
        assert!(second.metadata.is_empty());
    }

    #[tokio::test]
    async fn get_or_create_creates_once() {
        let (_, reg) = registry();
        let created = reg.get_or_create("tenant-a").await.unwrap();
        assert_eq!(created.status, InstanceStatus::Active);

        let again = reg.get_or_create("tenant-a").await.unwrap();
        assert_eq!(again.created_at, created.created_at);
    }

    #[tokio::test]
    async fn get_or_create_rejects_empty_id() {
        let (_, reg) = registry();
        assert!(matches!(
            reg.get_or_create("   ").await,
            Err(RegistryError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn update_preserves_created_at() {
        let (_, reg) = registry();
        let original = reg.get_or_create("tenant-a").await.unwrap();

        let mut changed = original.clone();
        changed.created_at = Utc::now() + chrono::Duration::days(30);
        changed.status = InstanceStatus::Paused;
        reg.update(&changed).await.unwrap();

        let fetched = reg.get("tenant-a").await.unwrap();
        assert_eq!(fetched.created_at, original.created_at);
        assert_eq!(fetched.status, InstanceStatus::Paused);
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let (_, reg) = registry();
        let record = InstanceRecord::new("ghost", Utc::now());
        assert!(matches!(
            reg.update(&record).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_purges_everything() {
        let (backend, reg) = registry();
        reg.get_or_create("tenant-a").await.unwrap();
        reg.update_last_active("tenant-a").await.unwrap();

        reg.delete("tenant-a").await.unwrap();
        assert!(matches!(
            reg.get("tenant-a").await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(!backend.exists("registry:instance:tenant-a").await.unwrap());
        assert!(reg.activity.read().is_empty());

        // The throttle slot is gone, so a recreated instance can update
        // immediately.
        reg.get_or_create("tenant-a").await.unwrap();
        assert!(reg.update_last_active("tenant-a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_updates_are_throttled_per_instance() {
        let (_, reg) = registry();
        reg.get_or_create("tenant-a").await.unwrap();
        reg.get_or_create("tenant-b").await.unwrap();

        assert!(reg.update_last_active("tenant-a").await.unwrap());
        for _ in 0..10 {
            assert!(!reg.update_last_active("tenant-a").await.unwrap());
        }
        // A different instance has its own throttle slot.
        assert!(reg.update_last_active("tenant-b").await.unwrap());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(reg.update_last_active("tenant-a").await.unwrap());
    }

    #[tokio::test]
    async fn list_applies_filters() {
        let (_, reg) = registry();
        let now = Utc::now();

        let mut eu = InstanceRecord::new("eu-1", now);
        eu.region = "eu".to_string();
        reg.register(&eu).await.unwrap();

        let mut us = InstanceRecord::new("us-1", now);
        us.region = "us".to_string();
        us.status = InstanceStatus::Paused;
        reg.register(&us).await.unwrap();

        let all = reg.list(&InstanceFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].instance_id, "eu-1");

        let by_region = reg
            .list(&InstanceFilter {
                region: Some("eu".to_string()),
                ..InstanceFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(by_region.len(), 1);
        assert_eq!(by_region[0].instance_id, "eu-1");

        let by_status = reg
            .list(&InstanceFilter {
                status: Some(InstanceStatus::Paused),
                ..InstanceFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(by_status.len(), 1);
        assert_eq!(by_status[0].instance_id, "us-1");
    }

    /// Backend that delegates everything to [`MemoryCache`] but leaves the
    /// default (unsupported) `scan`.
    struct NoScanCache(MemoryCache);

    #[async_trait]
    impl CacheBackend for NoScanCache {
        async fn get(&self, key: &str) -> Result<Bytes, CacheError> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
            self.0.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.0.delete(key).await
        }
        async fn exists(&self, key: &str) -> Result<bool, CacheError> {
            self.0.exists(key).await
        }
        async fn get_multiple(
            &self,
            keys: &[String],
        ) -> Result<StdHashMap<String, Bytes>, CacheError> {
            self.0.get_multiple(keys).await
        }
        async fn set_multiple(
            &self,
            entries: &[(String, Bytes)],
            ttl: Duration,
        ) -> Result<(), CacheError> {
            self.0.set_multiple(entries, ttl).await
        }
        async fn delete_multiple(&self, keys: &[String]) -> Result<(), CacheError> {
            self.0.delete_multiple(keys).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
            self.0.expire(key, ttl).await
        }
        async fn ping(&self) -> Result<(), CacheError> {
            self.0.ping().await
        }
        async fn close(&self) -> Result<(), CacheError> {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn list_degrades_to_empty_without_scan() {
        let backend = Arc::new(NoScanCache(MemoryCache::new()));
        let reg = InstanceRegistry::new(backend, RegistryConfig::default());
        reg.get_or_create("tenant-a").await.unwrap();

        let listed = reg.list(&InstanceFilter::default()).await.unwrap();
        assert!(listed.is_empty());
    }
}
