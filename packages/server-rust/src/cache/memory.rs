//! In-memory [`CacheBackend`] backed by [`DashMap`].
//!
//! The default backend for development and tests, and the reference
//! implementation of the backend contract (including the optional `scan`
//! capability). Expiry is lazy: reads drop expired entries on contact, and
//! `scan` sweeps whatever it touches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::cache::backend::CacheBackend;
use crate::error::CacheError;

struct StoredValue {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline < now)
    }
}

/// Concurrent in-memory cache with per-key TTL.
///
/// `default_ttl = None` means entries without an explicit TTL never expire.
/// Uses `tokio::time::Instant` so tests can drive expiry with
/// `tokio::time::pause()`.
pub struct MemoryCache {
    entries: DashMap<String, StoredValue>,
    default_ttl: Option<Duration>,
    closed: AtomicBool,
}

impl MemoryCache {
    /// Creates a cache whose default TTL is "never expire".
    #[must_use]
    pub fn new() -> Self {
        Self::with_default_ttl(None)
    }

    /// Creates a cache applying `default_ttl` to entries written with
    /// `ttl = ZERO`.
    #[must_use]
    pub fn with_default_ttl(default_ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of live entries. Sweeps expired ones as a side effect.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.retain(|_, v| !v.is_expired(now));
        self.entries.len()
    }

    /// Whether the cache holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry. Test helper for "flush the cache" scenarios.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn check_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    fn effective_deadline(&self, ttl: Duration) -> Option<Instant> {
        let effective = if ttl.is_zero() { self.default_ttl } else { Some(ttl) };
        effective.map(|d| Instant::now() + d)
    }

    fn get_live(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(stored) if !stored.is_expired(now) => Some(stored.value.clone()),
            Some(_) => {
                drop(self.entries.remove(key));
                None
            }
            None => None,
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Bytes, CacheError> {
        self.check_open()?;
        self.get_live(key)
            .ok_or_else(|| CacheError::KeyNotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.check_open()?;
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: self.effective_deadline(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check_open()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.check_open()?;
        Ok(self.get_live(key).is_some())
    }

    async fn get_multiple(&self, keys: &[String]) -> Result<HashMap<String, Bytes>, CacheError> {
        self.check_open()?;
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get_live(key) {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    async fn set_multiple(
        &self,
        entries: &[(String, Bytes)],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.check_open()?;
        for (key, value) in entries {
            self.entries.insert(
                key.clone(),
                StoredValue {
                    value: value.clone(),
                    expires_at: self.effective_deadline(ttl),
                },
            );
        }
        Ok(())
    }

    async fn delete_multiple(&self, keys: &[String]) -> Result<(), CacheError> {
        self.check_open()?;
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.check_open()?;
        let deadline = self.effective_deadline(ttl);
        match self.entries.get_mut(key) {
            Some(mut stored) => {
                stored.expires_at = deadline;
                Ok(())
            }
            None => Err(CacheError::KeyNotFound(key.to_string())),
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.check_open()?;
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let now = Instant::now();
        self.entries.retain(|_, v| !v.is_expired(now));
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.check_open()
    }

    async fn close(&self) -> Result<(), CacheError> {
        self.closed.store(true, Ordering::Release);
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let cache = MemoryCache::new();
        cache.set("k1", b("v1"), Duration::ZERO).await.unwrap();

        assert_eq!(cache.get("k1").await.unwrap(), b("v1"));
        assert!(cache.exists("k1").await.unwrap());

        cache.delete("k1").await.unwrap();
        assert!(matches!(
            cache.get("k1").await,
            Err(CacheError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_absent_key_is_ok() {
        let cache = MemoryCache::new();
        assert!(cache.delete("ghost").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_ttl_expires() {
        let cache = MemoryCache::new();
        cache.set("k", b("v"), Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cache.exists("k").await.unwrap());
        assert!(cache.get("k").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_uses_backend_default() {
        let cache = MemoryCache::with_default_ttl(Some(Duration::from_secs(5)));
        cache.set("k", b("v"), Duration::ZERO).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get("k").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_without_default_never_expires() {
        let cache = MemoryCache::new();
        cache.set("k", b("v"), Duration::ZERO).await.unwrap();

        tokio::time::advance(Duration::from_secs(24 * 3600)).await;
        assert_eq!(cache.get("k").await.unwrap(), b("v"));
    }

    #[tokio::test(start_paused = true)]
    async fn expire_resets_the_deadline() {
        let cache = MemoryCache::new();
        cache.set("k", b("v"), Duration::from_secs(5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        cache.expire("k", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(cache.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn expire_absent_key_reports_not_found() {
        let cache = MemoryCache::new();
        assert!(matches!(
            cache.expire("ghost", Duration::from_secs(1)).await,
            Err(CacheError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn get_multiple_omits_missing_keys() {
        let cache = MemoryCache::new();
        cache.set("a", b("1"), Duration::ZERO).await.unwrap();
        cache.set("c", b("3"), Duration::ZERO).await.unwrap();

        let keys: Vec<String> = ["a", "b", "c"].iter().map(ToString::to_string).collect();
        let found = cache.get_multiple(&keys).await.unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found["a"], b("1"));
        assert_eq!(found["c"], b("3"));
        assert!(!found.contains_key("b"));
    }

    #[tokio::test]
    async fn set_and_delete_multiple() {
        let cache = MemoryCache::new();
        let entries = vec![("a".to_string(), b("1")), ("b".to_string(), b("2"))];
        cache.set_multiple(&entries, Duration::ZERO).await.unwrap();
        assert_eq!(cache.len(), 2);

        let keys: Vec<String> = entries.into_iter().map(|(k, _)| k).collect();
        cache.delete_multiple(&keys).await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn scan_matches_prefix_and_sorts() {
        let cache = MemoryCache::new();
        for key in ["instance:a:cache:k2", "instance:a:cache:k1", "instance:b:cache:k1"] {
            cache.set(key, b("v"), Duration::ZERO).await.unwrap();
        }

        let keys = cache.scan("instance:a:*").await.unwrap();
        assert_eq!(keys, vec!["instance:a:cache:k1", "instance:a:cache:k2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_skips_expired_entries() {
        let cache = MemoryCache::new();
        cache.set("p:live", b("v"), Duration::ZERO).await.unwrap();
        cache.set("p:dead", b("v"), Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.scan("p:*").await.unwrap(), vec!["p:live"]);
    }

    #[tokio::test]
    async fn close_rejects_further_operations() {
        let cache = MemoryCache::new();
        cache.set("k", b("v"), Duration::ZERO).await.unwrap();
        cache.close().await.unwrap();

        assert!(matches!(cache.ping().await, Err(CacheError::Closed)));
        assert!(matches!(
            cache.set("k", b("v"), Duration::ZERO).await,
            Err(CacheError::Closed)
        ));
        assert!(matches!(cache.get("k").await, Err(CacheError::Closed)));
    }

    #[tokio::test]
    async fn ping_succeeds_while_open() {
        let cache = MemoryCache::new();
        assert!(cache.ping().await.is_ok());
    }
}
