//! Lifecycle operations (T3): bulk load, delete, backup, and restore per
//! instance.
//!
//! These are the heavyweight operations behind cleanup and operational
//! tooling. They page through the durable store in fixed-size batches so an
//! instance of any size moves without unbounded memory, and they drive the
//! registry's status field (`migrating` during a load, `deleting` during a
//! removal) so the middleware keeps answering honestly while they run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use warren_core::{CacheEntry, InstanceStatus};

use crate::cache::{CacheBackend, ContextCache};
use crate::error::CacheError;
use crate::registry::InstanceRegistry;
use crate::store::InstanceStore;

/// Cache writes per `set_multiple` call during a load.
const CACHE_LOAD_CHUNK: usize = 1000;

/// Store keys fetched per page.
const STORE_PAGE_SIZE: u64 = 1000;

/// Bulk operations over one instance's data.
pub struct LifecycleManager {
    registry: Arc<InstanceRegistry>,
    store: Arc<dyn InstanceStore>,
    cache: Arc<dyn CacheBackend>,
}

impl LifecycleManager {
    /// Wires the manager over the shared components.
    #[must_use]
    pub fn new(
        registry: Arc<InstanceRegistry>,
        store: Arc<dyn InstanceStore>,
        cache: Arc<dyn CacheBackend>,
    ) -> Self {
        Self {
            registry,
            store,
            cache,
        }
    }

    /// Streams every durable entry of the instance into the cache.
    ///
    /// Status goes `migrating` for the duration and `active` on completion,
    /// with `last_loaded` / `loaded_keys` stamped into the record metadata.
    /// Returns the number of keys loaded.
    ///
    /// # Errors
    ///
    /// Registry, store, and cache failures; on failure the status is left at
    /// `migrating` (which still accepts requests) for the operator to
    /// retry.
    pub async fn load_instance(&self, instance_id: &str) -> anyhow::Result<u64> {
        let mut record = self.registry.get(instance_id).await?;
        record.status = InstanceStatus::Migrating;
        self.registry.update(&record).await?;

        let cache = ContextCache::for_instance(Arc::clone(&self.cache), instance_id);
        let mut offset = 0u64;
        let mut loaded = 0u64;

        loop {
            let keys = self
                .store
                .get_keys_by_instance(instance_id, offset, STORE_PAGE_SIZE)
                .await?;
            if keys.is_empty() {
                break;
            }
            offset += keys.len() as u64;

            let mut entries = self.store.batch_get(instance_id, &keys).await?;
            let mut batch = Vec::with_capacity(entries.len());
            for key in &keys {
                // Keys without a live entry expired between the two reads.
                if let Some(entry) = entries.remove(key) {
                    batch.push((key.clone(), Bytes::from(serde_json::to_vec(&entry.value)?)));
                }
            }
            for chunk in batch.chunks(CACHE_LOAD_CHUNK) {
                cache.set_multiple(chunk, Duration::ZERO).await?;
            }
            loaded += batch.len() as u64;
        }

        let mut record = self.registry.get(instance_id).await?;
        record.status = InstanceStatus::Active;
        record.metadata.insert(
            "last_loaded".to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        record
            .metadata
            .insert("loaded_keys".to_string(), loaded.to_string());
        self.registry.update(&record).await?;

        info!(instance_id, loaded, "instance loaded into cache");
        Ok(loaded)
    }

    /// Removes the instance everywhere: cache (where the backend can scan),
    /// durable store, and registry.
    ///
    /// # Errors
    ///
    /// Registry and store failures abort the removal; a cache backend
    /// without scan support is not an error (entries age out via TTL).
    pub async fn delete_instance(&self, instance_id: &str) -> anyhow::Result<()> {
        let mut record = self.registry.get(instance_id).await?;
        record.status = InstanceStatus::Deleting;
        self.registry.update(&record).await?;

        let pattern = ContextCache::for_instance(Arc::clone(&self.cache), instance_id)
            .scan_pattern();
        match self.cache.scan(&pattern).await {
            Ok(keys) if !keys.is_empty() => {
                // Scan returns fully-namespaced keys; delete them raw.
                self.cache.delete_multiple(&keys).await?;
                debug!(instance_id, count = keys.len(), "cache entries deleted");
            }
            Ok(_) => {}
            Err(CacheError::Unsupported(_)) => {
                debug!(instance_id, "cache backend cannot scan; relying on TTL expiry");
            }
            Err(err) => return Err(err.into()),
        }

        let removed = self.store.delete_by_instance(instance_id).await?;
        self.registry.delete(instance_id).await?;

        info!(instance_id, removed, "instance deleted");
        Ok(())
    }

    /// Streams every durable entry as JSON Lines into `writer`, one record
    /// per line, ordered by key. Returns the number of entries written.
    ///
    /// # Errors
    ///
    /// Store and I/O failures.
    pub async fn backup_instance<W>(
        &self,
        instance_id: &str,
        writer: &mut W,
    ) -> anyhow::Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut offset = 0u64;
        let mut written = 0u64;

        loop {
            let keys = self
                .store
                .get_keys_by_instance(instance_id, offset, STORE_PAGE_SIZE)
                .await?;
            if keys.is_empty() {
                break;
            }
            offset += keys.len() as u64;

            let mut entries = self.store.batch_get(instance_id, &keys).await?;
            for key in &keys {
                if let Some(entry) = entries.remove(key) {
                    let line = serde_json::to_vec(&entry)?;
                    writer.write_all(&line).await?;
                    writer.write_all(b"\n").await?;
                    written += 1;
                }
            }
        }

        writer.flush().await?;
        debug!(instance_id, written, "instance backed up");
        Ok(written)
    }

    /// Imports JSON Lines from `reader`, overriding each record's
    /// `instance_id` with the argument, in a single atomic batch: any parse
    /// or store error rolls back the entire import.
    ///
    /// # Errors
    ///
    /// Parse failures (with the offending line number) and store failures.
    pub async fn restore_instance<R>(&self, instance_id: &str, reader: R) -> anyhow::Result<u64>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut lines = reader.lines();
        let mut entries = Vec::new();
        let mut line_no = 0u64;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let mut entry: CacheEntry = serde_json::from_str(&line)
                .with_context(|| format!("parsing archive line {line_no}"))?;
            entry.instance_id = instance_id.to_string();
            entries.push(entry);
        }

        let restored = self.store.put_entries(instance_id, entries).await?;
        info!(instance_id, restored, "instance restored");
        Ok(restored)
    }
}
