//! The persistent cache entry model and its expiry rule.
//!
//! A [`CacheEntry`] is one durable row: a JSON value stored under the
//! composite identity `(instance_id, key)` with a monotonically increasing
//! version. The same shape is used as the JSON Lines record format for
//! instance archives and backup/restore streams.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

fn default_metadata() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// One durable cache entry, identified by `(instance_id, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Owning instance; the first half of the composite identity.
    pub instance_id: String,
    /// Caller-visible key; the second half of the composite identity.
    pub key: String,
    /// The stored value. Always valid JSON; opaque byte payloads that do not
    /// parse as JSON are wrapped as a JSON string before they reach this type.
    pub value: serde_json::Value,
    /// Monotonic version, starting at 1 and incremented on every update.
    pub version: i64,
    /// Time-to-live in seconds. `None` means the entry never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    /// Arbitrary JSON metadata, default `{}`.
    #[serde(default = "default_metadata")]
    pub metadata: serde_json::Value,
    /// Creation time of the row.
    pub created_at: DateTime<Utc>,
    /// Time of the last write. The expiry clock starts here.
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Creates a version-1 entry with empty metadata and no TTL.
    #[must_use]
    pub fn new(
        instance_id: &str,
        key: &str,
        value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            key: key.to_string(),
            value,
            version: 1,
            ttl: None,
            metadata: default_metadata(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The absolute expiry time, or `None` when the entry never expires.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.ttl.map(|secs| self.updated_at + Duration::seconds(secs))
    }

    /// Whether the entry is past its TTL at `now`.
    ///
    /// Expired entries are treated as non-existent by every read path.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|deadline| deadline < now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn new_entry_starts_at_version_one() {
        let entry = CacheEntry::new("a", "k", serde_json::json!({"x": 1}), base_time());
        assert_eq!(entry.version, 1);
        assert!(entry.ttl.is_none());
        assert_eq!(entry.metadata, serde_json::json!({}));
        assert_eq!(entry.created_at, entry.updated_at);
    }

    #[test]
    fn no_ttl_never_expires() {
        let entry = CacheEntry::new("a", "k", serde_json::json!(1), base_time());
        assert!(entry.expires_at().is_none());
        assert!(!entry.is_expired(base_time() + Duration::days(3650)));
    }

    #[test]
    fn ttl_expiry_boundary() {
        let mut entry = CacheEntry::new("a", "k", serde_json::json!(1), base_time());
        entry.ttl = Some(60);

        let deadline = base_time() + Duration::seconds(60);
        assert_eq!(entry.expires_at(), Some(deadline));

        // At the deadline the entry is still readable; strictly past it, gone.
        assert!(!entry.is_expired(deadline));
        assert!(entry.is_expired(deadline + Duration::nanoseconds(1)));
    }

    #[test]
    fn expiry_clock_starts_at_updated_at() {
        let mut entry = CacheEntry::new("a", "k", serde_json::json!(1), base_time());
        entry.ttl = Some(10);
        entry.updated_at = base_time() + Duration::minutes(5);

        assert!(!entry.is_expired(base_time() + Duration::minutes(5) + Duration::seconds(10)));
        assert!(entry.is_expired(base_time() + Duration::minutes(6)));
    }

    #[test]
    fn jsonl_round_trip() {
        let mut entry = CacheEntry::new("tenant-a", "k1", serde_json::json!("v1"), base_time());
        entry.ttl = Some(3600);
        entry.metadata = serde_json::json!({"source": "restore"});

        let line = serde_json::to_string(&entry).unwrap();
        assert!(!line.contains('\n'));

        let parsed: CacheEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn missing_ttl_and_metadata_default() {
        let json = r#"{
            "instance_id": "a",
            "key": "k",
            "value": 7,
            "version": 3,
            "created_at": "2024-06-01T12:00:00Z",
            "updated_at": "2024-06-01T12:00:00Z"
        }"#;
        let entry: CacheEntry = serde_json::from_str(json).unwrap();
        assert!(entry.ttl.is_none());
        assert_eq!(entry.metadata, serde_json::json!({}));
    }
}
