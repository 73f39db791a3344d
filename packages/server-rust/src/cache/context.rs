//! Instance-scoped view over a [`CacheBackend`].
//!
//! A [`ContextCache`] is constructed per request from the resolved instance
//! id. It applies the key builder to every input key on the way in and maps
//! results back to the caller's original keys on the way out, so handlers
//! never see (or accidentally leak) namespaced keys.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use warren_core::KeyBuilder;

use crate::cache::backend::CacheBackend;
use crate::error::CacheError;

/// Fallback tenant when a request carries no instance id at all.
pub const FALLBACK_INSTANCE_ID: &str = "global";

/// A cache view scoped to one instance.
///
/// Cheap to construct; handlers build one per request.
#[derive(Clone)]
pub struct ContextCache {
    backend: Arc<dyn CacheBackend>,
    builder: KeyBuilder,
}

impl ContextCache {
    /// Creates a view scoped to `instance_id`; empty ids fall back to
    /// [`FALLBACK_INSTANCE_ID`].
    #[must_use]
    pub fn for_instance(backend: Arc<dyn CacheBackend>, instance_id: &str) -> Self {
        let id = instance_id.trim();
        let builder = if id.is_empty() {
            KeyBuilder::new(FALLBACK_INSTANCE_ID)
        } else {
            KeyBuilder::new(id)
        };
        Self { backend, builder }
    }

    /// The instance id this view is scoped to.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        self.builder.instance_id()
    }

    /// The scan pattern covering every key this view can produce.
    #[must_use]
    pub fn scan_pattern(&self) -> String {
        self.builder.pattern("")
    }

    /// Fetches one value by caller-visible key.
    ///
    /// # Errors
    ///
    /// [`CacheError::KeyNotFound`] when absent; backend errors otherwise.
    pub async fn get(&self, key: &str) -> Result<Bytes, CacheError> {
        self.backend.get(&self.builder.cache_key(key)).await
    }

    /// Stores one value. `ttl = ZERO` applies the backend default.
    pub async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.backend
            .set(&self.builder.cache_key(key), value, ttl)
            .await
    }

    /// Removes one key.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.backend.delete(&self.builder.cache_key(key)).await
    }

    /// Whether a live value exists for the key.
    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.backend.exists(&self.builder.cache_key(key)).await
    }

    /// Fetches many values, keyed by the caller's original keys.
    ///
    /// Missing keys are simply absent from the result map.
    pub async fn get_multiple(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Bytes>, CacheError> {
        let namespaced: Vec<String> = keys.iter().map(|k| self.builder.cache_key(k)).collect();
        let mut found = self.backend.get_multiple(&namespaced).await?;

        let mut result = HashMap::with_capacity(found.len());
        for (original, scoped) in keys.iter().zip(&namespaced) {
            if let Some(value) = found.remove(scoped) {
                result.insert(original.clone(), value);
            }
        }
        Ok(result)
    }

    /// Stores many values under one TTL policy.
    pub async fn set_multiple(
        &self,
        entries: &[(String, Bytes)],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let namespaced: Vec<(String, Bytes)> = entries
            .iter()
            .map(|(k, v)| (self.builder.cache_key(k), v.clone()))
            .collect();
        self.backend.set_multiple(&namespaced, ttl).await
    }

    /// Removes many keys.
    pub async fn delete_multiple(&self, keys: &[String]) -> Result<(), CacheError> {
        let namespaced: Vec<String> = keys.iter().map(|k| self.builder.cache_key(k)).collect();
        self.backend.delete_multiple(&namespaced).await
    }
}
