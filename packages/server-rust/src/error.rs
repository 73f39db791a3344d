//! Typed error kinds for each subsystem and the HTTP error-body contract.
//!
//! Internal errors stay typed per subsystem ([`CacheError`], [`StoreError`],
//! [`RegistryError`]); everything that crosses the HTTP boundary is
//! normalized into an [`ApiError`] which renders the fixed error-body shape
//! `{"error", "code", "instance_id"?, "status"?}` with a code from the
//! published set.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use warren_core::InstanceStatus;

/// Error codes crossing the HTTP boundary. Names are a wire contract.
pub mod codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const KEY_NOT_FOUND: &str = "KEY_NOT_FOUND";
    pub const MISSING_INSTANCE_ID: &str = "MISSING_INSTANCE_ID";
    pub const INSTANCE_NOT_FOUND: &str = "INSTANCE_NOT_FOUND";
    pub const INSTANCE_INACTIVE: &str = "INSTANCE_INACTIVE";
    pub const INSTANCE_PAUSED: &str = "INSTANCE_PAUSED";
    pub const INSTANCE_DELETING: &str = "INSTANCE_DELETING";
    pub const INSTANCE_UNAVAILABLE: &str = "INSTANCE_UNAVAILABLE";
    pub const INSTANCE_LOAD_ERROR: &str = "INSTANCE_LOAD_ERROR";
    pub const UPSTREAM_UNAVAILABLE: &str = "UPSTREAM_UNAVAILABLE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Errors from the cache adapter (L2).
#[derive(Debug, Error)]
pub enum CacheError {
    /// The key is absent (or expired, which reads identically).
    #[error("key not found: {0}")]
    KeyNotFound(String),
    /// The backend rejected or failed the operation.
    #[error("cache backend: {0}")]
    Backend(String),
    /// The backend was closed; no further operations are accepted.
    #[error("cache backend closed")]
    Closed,
    /// The backend does not implement this optional capability.
    #[error("operation not supported by this cache backend: {0}")]
    Unsupported(&'static str),
}

/// Errors from the durable store adapter (L3).
#[derive(Debug, Error)]
pub enum StoreError {
    /// No live entry for `(instance_id, key)`.
    #[error("entry not found: {instance_id}/{key}")]
    NotFound {
        instance_id: String,
        key: String,
    },
    /// Optimistic concurrency check failed; retryable by the caller.
    #[error("version mismatch for {key}: expected {expected}, found {actual}")]
    VersionMismatch {
        key: String,
        expected: i64,
        actual: i64,
    },
    /// Value (de)serialization failed. Fatal for the request.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The backend rejected or failed the operation.
    #[error("store backend: {0}")]
    Backend(String),
}

/// Errors from the instance registry (M1).
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No record for the id and auto-creation was not requested.
    #[error("instance not found: {0}")]
    NotFound(String),
    /// The record violates its invariants.
    #[error("invalid instance record: {0}")]
    Invalid(String),
    /// Record (de)serialization failed. Fatal for the request.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The backing store rejected or failed the operation.
    #[error("registry backend: {0}")]
    Backend(String),
}

/// The normalized JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Human-readable message. Never includes internal details.
    pub error: String,
    /// One of the [`codes`] constants.
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Boundary error: everything a handler can surface to a client.
///
/// `IntoResponse` renders the status code and [`ErrorBody`] mandated by the
/// API contract, so handlers simply return `Result<_, ApiError>`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request: missing key, unreadable body.
    #[error("{message}")]
    InvalidRequest { message: String },
    /// The requested key exists in neither cache nor store.
    #[error("key not found")]
    KeyNotFound,
    /// The instance id could not be resolved to a record.
    #[error("instance not found: {instance_id}")]
    InstanceNotFound { instance_id: String },
    /// The instance exists but its status forbids requests.
    #[error("instance {instance_id} is {status}")]
    InstanceUnavailable {
        instance_id: String,
        status: InstanceStatus,
    },
    /// The replica could not reach the primary.
    #[error("primary unavailable: {message}")]
    Upstream { message: String },
    /// Anything unexpected. Details go to the log, not the client.
    #[error("internal error")]
    Internal { message: String },
}

impl ApiError {
    /// Wraps an internal failure, logging the detail that the response omits.
    #[must_use]
    pub fn internal(context: &str, err: &dyn std::fmt::Display) -> Self {
        tracing::error!(context, error = %err, "internal error");
        Self::Internal {
            message: format!("{context}: {err}"),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::KeyNotFound | Self::InstanceNotFound { .. } => StatusCode::NOT_FOUND,
            Self::InstanceUnavailable { status, .. } => match status {
                InstanceStatus::Deleting => StatusCode::GONE,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::Upstream { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => codes::INVALID_REQUEST,
            Self::KeyNotFound => codes::KEY_NOT_FOUND,
            Self::InstanceNotFound { .. } => codes::INSTANCE_NOT_FOUND,
            Self::InstanceUnavailable { status, .. } => match status {
                InstanceStatus::Deleting => codes::INSTANCE_DELETING,
                InstanceStatus::Inactive => codes::INSTANCE_INACTIVE,
                InstanceStatus::Paused => codes::INSTANCE_PAUSED,
                _ => codes::INSTANCE_UNAVAILABLE,
            },
            Self::Upstream { .. } => codes::UPSTREAM_UNAVAILABLE,
            Self::Internal { .. } => codes::INTERNAL_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        let (instance_id, status) = match self {
            Self::InstanceNotFound { instance_id } => (Some(instance_id.clone()), None),
            Self::InstanceUnavailable {
                instance_id,
                status,
            } => (
                Some(instance_id.clone()),
                Some(status.as_str().to_string()),
            ),
            _ => (None, None),
        };
        let error = match self {
            // Internal detail stays in the log.
            Self::Internal { .. } => "internal error".to_string(),
            other => other.to_string(),
        };
        ErrorBody {
            error,
            code: self.code(),
            instance_id,
            status,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}
