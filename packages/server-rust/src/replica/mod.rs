//! Replica forwarder (M4): outbound HTTP from a replica to the primary.
//!
//! One shared [`reqwest::Client`] (10-second default timeout) serves three
//! flows: forwarded writes (carrying the LWW timestamp header), forwarded
//! deletes (fire-and-forget), and miss-reads with a tight per-request
//! timeout. The primary resolves racing forwarded writes by timestamp, so
//! replicas never need to coordinate among themselves.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};
use warren_core::{format_write_timestamp, HEADER_INSTANCE_ID, HEADER_WRITE_TIMESTAMP};

use crate::metrics;

/// Errors talking to the primary.
#[derive(Debug, Error)]
pub enum PrimaryError {
    /// The primary answered with an unexpected status.
    #[error("primary returned status {0}")]
    Status(http::StatusCode),
    /// Transport-level failure (connect, timeout, reset).
    #[error("primary request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Outcome of a miss-read against the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryFetch {
    /// The primary holds the key; raw value bytes attached.
    Found(Bytes),
    /// The primary answered 404.
    NotFound,
}

/// HTTP client bound to one primary base URL.
pub struct PrimaryClient {
    http: reqwest::Client,
    base_url: String,
}

impl PrimaryClient {
    /// Builds the shared client.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying HTTP client cannot be built.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, PrimaryError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// The primary's base URL (no trailing slash).
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn entry_url(&self, key: &str) -> String {
        format!("{}/v1/cache/{}", self.base_url, urlencoding::encode(key))
    }

    /// Forwards one write: `PUT /v1/cache/{key}` with the raw payload and
    /// the instance + LWW timestamp headers.
    ///
    /// Failures are counted (`write_forwards{result=error}`) and surfaced to
    /// the caller for logging only -- the replica's client already got 200.
    pub async fn forward_write(
        &self,
        instance_id: &str,
        key: &str,
        value: Bytes,
        timestamp: DateTime<Utc>,
    ) -> Result<(), PrimaryError> {
        let outcome = self
            .http
            .put(self.entry_url(key))
            .header(HEADER_INSTANCE_ID, instance_id)
            .header(HEADER_WRITE_TIMESTAMP, format_write_timestamp(timestamp))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(value)
            .send()
            .await;

        match outcome {
            Ok(response) if response.status().is_success() => {
                metrics::record_write_forward(instance_id, "success");
                debug!(key, instance_id, "write forwarded to primary");
                Ok(())
            }
            Ok(response) => {
                metrics::record_write_forward(instance_id, "error");
                Err(PrimaryError::Status(response.status()))
            }
            Err(err) => {
                metrics::record_write_forward(instance_id, "error");
                Err(err.into())
            }
        }
    }

    /// Forwards one delete: `DELETE /v1/cache/{key}`. Fire-and-forget at the
    /// call site; errors only matter to the log.
    pub async fn forward_delete(&self, instance_id: &str, key: &str) -> Result<(), PrimaryError> {
        let response = self
            .http
            .delete(self.entry_url(key))
            .header(HEADER_INSTANCE_ID, instance_id)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(PrimaryError::Status(response.status()))
        }
    }

    /// Miss-read: `GET /v1/cache/{key}` with a tight per-request timeout.
    ///
    /// # Errors
    ///
    /// Network failures and non-200/404 statuses; both counted as
    /// `primary_queries{result=error}`.
    pub async fn fetch(
        &self,
        instance_id: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<PrimaryFetch, PrimaryError> {
        let outcome = self
            .http
            .get(self.entry_url(key))
            .header(HEADER_INSTANCE_ID, instance_id)
            .timeout(timeout)
            .send()
            .await;

        match outcome {
            Ok(response) if response.status() == http::StatusCode::OK => {
                let bytes = response.bytes().await?;
                metrics::record_primary_query(instance_id, "hit");
                Ok(PrimaryFetch::Found(bytes))
            }
            Ok(response) if response.status() == http::StatusCode::NOT_FOUND => {
                metrics::record_primary_query(instance_id, "miss");
                Ok(PrimaryFetch::NotFound)
            }
            Ok(response) => {
                metrics::record_primary_query(instance_id, "error");
                Err(PrimaryError::Status(response.status()))
            }
            Err(err) => {
                metrics::record_primary_query(instance_id, "error");
                warn!(key, instance_id, error = %err, "primary query failed");
                Err(err.into())
            }
        }
    }

    /// Probes the primary's `/health` with the given timeout.
    pub async fn health(&self, timeout: Duration) -> bool {
        let outcome = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(timeout)
            .send()
            .await;
        matches!(outcome, Ok(response) if response.status().is_success())
    }
}
