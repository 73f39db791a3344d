//! Queued write requests and the last-write-wins timestamp token.
//!
//! A [`WriteRequest`] travels from a request handler through the async
//! writer's bounded queue to the durable store, or across the wire from a
//! replica to the primary. In both cases `timestamp` is the client-observable
//! write time and the LWW ordering token: when two writes to the same
//! `(instance, key)` race, the larger timestamp wins.
//!
//! # Wire format
//!
//! Timestamps cross the HTTP boundary in the `X-Write-Timestamp` header as
//! RFC 3339 with nanosecond precision (`2024-01-01T00:00:00.000000001Z`),
//! which [`format_write_timestamp`] and [`parse_write_timestamp`] round-trip
//! exactly.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};

/// Header carrying the tenant tag on every cache request.
pub const HEADER_INSTANCE_ID: &str = "x-instance-id";

/// Header carrying the LWW write timestamp on forwarded writes.
pub const HEADER_WRITE_TIMESTAMP: &str = "x-write-timestamp";

/// One pending durable write.
///
/// Owned by the async write queue from enqueue until terminal success or
/// drop; `retry_count` is bumped by the worker on every failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// Caller-visible key (not yet namespaced).
    pub key: String,
    /// Opaque payload bytes as received from the client.
    pub value: Bytes,
    /// Client-observable write time; the LWW ordering token.
    pub timestamp: DateTime<Utc>,
    /// Owning instance.
    pub instance_id: String,
    /// Failed persistence attempts so far.
    pub retry_count: u32,
}

impl WriteRequest {
    /// Creates a fresh request with zero retries.
    #[must_use]
    pub fn new(
        key: &str,
        value: Bytes,
        instance_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.to_string(),
            value,
            timestamp,
            instance_id: instance_id.to_string(),
            retry_count: 0,
        }
    }
}

/// Formats a timestamp for the `X-Write-Timestamp` header: RFC 3339 with
/// nanosecond precision and a `Z` suffix.
#[must_use]
pub fn format_write_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parses an `X-Write-Timestamp` header value.
///
/// Accepts any RFC 3339 offset; the result is normalized to UTC. Returns
/// `None` for unparseable input, in which case callers stamp their own time.
#[must_use]
pub fn parse_write_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
