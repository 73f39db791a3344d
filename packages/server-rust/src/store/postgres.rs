//! PostgreSQL [`InstanceStore`] via `sqlx` (cargo feature `postgres`).
//!
//! Maps the store contract onto a single `cache_entries` table with the
//! composite primary key `(instance_id, key)` and a JSONB value column. The
//! LWW guard lives in the upsert's `WHERE` clause so racing forwarded writes
//! resolve inside the database, not in application code.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use warren_core::CacheEntry;

use crate::error::StoreError;
use crate::store::{normalize_value, InstanceStore};

/// DDL applied at startup. Idempotent.
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS cache_entries (
    instance_id TEXT        NOT NULL,
    key         TEXT        NOT NULL,
    value       JSONB       NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL,
    version     BIGINT      NOT NULL DEFAULT 1,
    ttl         BIGINT,
    metadata    JSONB       NOT NULL DEFAULT '{}'::jsonb,
    PRIMARY KEY (instance_id, key)
);
CREATE INDEX IF NOT EXISTS idx_cache_entries_instance_updated
    ON cache_entries (instance_id, updated_at);
CREATE INDEX IF NOT EXISTS idx_cache_entries_instance_created
    ON cache_entries (instance_id, created_at);
";

/// A row is live when it has no TTL or its deadline has not passed.
const LIVE: &str = "(ttl IS NULL OR updated_at + ttl * interval '1 second' >= now())";

/// Durable store backed by PostgreSQL.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the pool cannot be established or the
    /// DDL fails.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(backend)?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await.map_err(backend)?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool (tests, shared pools). Does not apply the schema.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn not_found(instance_id: &str, key: &str) -> StoreError {
    StoreError::NotFound {
        instance_id: instance_id.to_string(),
        key: key.to_string(),
    }
}

fn as_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn row_to_entry(row: &PgRow) -> Result<CacheEntry, StoreError> {
    Ok(CacheEntry {
        instance_id: row.try_get("instance_id").map_err(backend)?,
        key: row.try_get("key").map_err(backend)?,
        value: row.try_get("value").map_err(backend)?,
        version: row.try_get("version").map_err(backend)?,
        ttl: row.try_get("ttl").map_err(backend)?,
        metadata: row.try_get("metadata").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

#[async_trait]
impl InstanceStore for PostgresStore {
    async fn get(&self, instance_id: &str, key: &str) -> Result<CacheEntry, StoreError> {
        let row = sqlx::query(
            "SELECT instance_id, key, value, version, ttl, metadata, created_at, updated_at \
             FROM cache_entries WHERE instance_id = $1 AND key = $2",
        )
        .bind(instance_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let Some(row) = row else {
            return Err(not_found(instance_id, key));
        };
        let entry = row_to_entry(&row)?;
        if entry.is_expired(Utc::now()) {
            // Opportunistic removal of the expired row.
            let _ = sqlx::query("DELETE FROM cache_entries WHERE instance_id = $1 AND key = $2")
                .bind(instance_id)
                .bind(key)
                .execute(&self.pool)
                .await;
            return Err(not_found(instance_id, key));
        }
        Ok(entry)
    }

    async fn set(
        &self,
        instance_id: &str,
        key: &str,
        value: &[u8],
        write_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let value = normalize_value(instance_id, key, value);
        sqlx::query(
            "INSERT INTO cache_entries \
                 (instance_id, key, value, created_at, updated_at, version, metadata) \
             VALUES ($1, $2, $3, $4, $4, 1, '{}'::jsonb) \
             ON CONFLICT (instance_id, key) DO UPDATE SET \
                 value = EXCLUDED.value, \
                 version = cache_entries.version + 1, \
                 updated_at = EXCLUDED.updated_at \
             WHERE EXCLUDED.updated_at >= cache_entries.updated_at",
        )
        .bind(instance_id)
        .bind(key)
        .bind(&value)
        .bind(write_time)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, instance_id: &str, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM cache_entries WHERE instance_id = $1 AND key = $2")
            .bind(instance_id)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn exists(&self, instance_id: &str, key: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT 1 AS one FROM cache_entries \
             WHERE instance_id = $1 AND key = $2 AND {LIVE}"
        ))
        .bind(instance_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.is_some())
    }

    async fn batch_get(
        &self,
        instance_id: &str,
        keys: &[String],
    ) -> Result<HashMap<String, CacheEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT instance_id, key, value, version, ttl, metadata, created_at, updated_at \
             FROM cache_entries \
             WHERE instance_id = $1 AND key = ANY($2) AND {LIVE}"
        ))
        .bind(instance_id)
        .bind(keys)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in &rows {
            let entry = row_to_entry(row)?;
            found.insert(entry.key.clone(), entry);
        }
        Ok(found)
    }

    async fn get_all_keys(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query(
            "SELECT instance_id, key FROM cache_entries \
             ORDER BY instance_id, key OFFSET $1 LIMIT $2",
        )
        .bind(as_i64(offset))
        .bind(as_i64(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get("instance_id").map_err(backend)?,
                    row.try_get("key").map_err(backend)?,
                ))
            })
            .collect()
    }

    async fn get_keys_by_instance(
        &self,
        instance_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT key FROM cache_entries WHERE instance_id = $1 \
             ORDER BY key OFFSET $2 LIMIT $3",
        )
        .bind(instance_id)
        .bind(as_i64(offset))
        .bind(as_i64(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|row| row.try_get("key").map_err(backend))
            .collect()
    }

    async fn delete_by_instance(&self, instance_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn cleanup_expired(&self, batch: u64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE (instance_id, key) IN ( \
                 SELECT instance_id, key FROM cache_entries \
                 WHERE ttl IS NOT NULL \
                   AND updated_at + ttl * interval '1 second' < now() \
                 LIMIT $1)",
        )
        .bind(as_i64(batch))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn set_with_version(
        &self,
        instance_id: &str,
        key: &str,
        value: &[u8],
        expected_version: i64,
    ) -> Result<i64, StoreError> {
        let value = normalize_value(instance_id, key, value);
        let row = sqlx::query(
            "UPDATE cache_entries \
             SET value = $3, version = version + 1, updated_at = now() \
             WHERE instance_id = $1 AND key = $2 AND version = $4 \
             RETURNING version",
        )
        .bind(instance_id)
        .bind(key)
        .bind(&value)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        if let Some(row) = row {
            return row.try_get("version").map_err(backend);
        }

        // Distinguish a stale expectation from a missing row.
        let current = sqlx::query(
            "SELECT version FROM cache_entries WHERE instance_id = $1 AND key = $2",
        )
        .bind(instance_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match current {
            Some(row) => Err(StoreError::VersionMismatch {
                key: key.to_string(),
                expected: expected_version,
                actual: row.try_get("version").map_err(backend)?,
            }),
            None => Err(not_found(instance_id, key)),
        }
    }

    async fn put_entries(
        &self,
        instance_id: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let count = entries.len() as u64;

        for entry in entries {
            sqlx::query(
                "INSERT INTO cache_entries \
                     (instance_id, key, value, created_at, updated_at, version, ttl, metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (instance_id, key) DO UPDATE SET \
                     value = EXCLUDED.value, \
                     created_at = EXCLUDED.created_at, \
                     updated_at = EXCLUDED.updated_at, \
                     version = EXCLUDED.version, \
                     ttl = EXCLUDED.ttl, \
                     metadata = EXCLUDED.metadata",
            )
            .bind(instance_id)
            .bind(&entry.key)
            .bind(&entry.value)
            .bind(entry.created_at)
            .bind(entry.updated_at)
            .bind(entry.version)
            .bind(entry.ttl)
            .bind(&entry.metadata)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(count)
    }
}
