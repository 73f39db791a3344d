//! Cache endpoints (M3): mode-aware GET / PUT / DELETE / batch-get.
//!
//! Every handler works through a per-request [`ContextCache`] scoped to the
//! tenant the middleware resolved. The local cache is authoritative for the
//! client response; durability (primary) and forwarding (replica) happen
//! off the request path and never fail the client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use warren_core::{
    parse_write_timestamp, RequestContext, HEADER_INSTANCE_ID, HEADER_WRITE_TIMESTAMP,
};

use super::AppState;
use crate::cache::ContextCache;
use crate::config::DeploymentMode;
use crate::error::{ApiError, CacheError, StoreError};
use crate::metrics::record_cache_operation;
use crate::replica::PrimaryFetch;
use crate::store::normalize_value;

/// Timeout for detached durable-store operations (writes are queued; this
/// covers the direct read and delete paths).
const STORE_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for one replica-to-primary miss read.
const PRIMARY_FETCH_TIMEOUT: Duration = Duration::from_secs(2);

fn scoped_cache(state: &AppState, ctx: &RequestContext) -> ContextCache {
    ContextCache::for_instance(Arc::clone(&state.cache), ctx.instance_id())
}

fn raw_body_response(bytes: Bytes) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response()
}

/// The write time for this request: an `X-Write-Timestamp` header that
/// parses wins; anything else stamps now.
fn resolve_write_timestamp(headers: &HeaderMap) -> DateTime<Utc> {
    headers
        .get(HEADER_WRITE_TIMESTAMP)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_write_timestamp)
        .unwrap_or_else(Utc::now)
}

/// The tenant tag carried into the durable write: the header value verbatim
/// when present, so a forwarded write keeps the originating replica's tenant
/// even when this primary's default differs.
fn source_instance_id(headers: &HeaderMap, ctx: &RequestContext) -> String {
    headers
        .get(HEADER_INSTANCE_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(|| ctx.instance_id().to_string(), ToString::to_string)
}

/// `PUT`/`POST /v1/cache/{key}` -- write one value.
///
/// 200 when the local cache write succeeds; durable persistence and replica
/// forwarding happen asynchronously and never affect the response.
pub async fn put_entry_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let mode = state.mode_label();
    let timestamp = resolve_write_timestamp(&headers);
    let cache = scoped_cache(&state, &ctx);

    if let Err(err) = cache.set(&key, body.clone(), Duration::ZERO).await {
        record_cache_operation("put", "error", ctx.instance_id(), mode);
        return Err(ApiError::internal("cache write", &err));
    }
    record_cache_operation("put", "success", ctx.instance_id(), mode);

    match state.mode() {
        DeploymentMode::Primary => {
            if let Some(writer) = &state.writer {
                let source = source_instance_id(&headers, &ctx);
                writer.write(&key, body, &source, timestamp);
            }
        }
        DeploymentMode::Replica => {
            if let Some(primary) = &state.primary {
                let primary = Arc::clone(primary);
                let instance_id = ctx.instance_id().to_string();
                let key = key.clone();
                tokio::spawn(async move {
                    if let Err(err) = primary
                        .forward_write(&instance_id, &key, body, timestamp)
                        .await
                    {
                        warn!(key, instance_id, error = %err, "write forward failed");
                    }
                });
            }
        }
    }

    Ok(StatusCode::OK)
}

/// `GET /v1/cache/{key}` -- read with fallthrough.
///
/// Cache hit serves directly. A miss falls through to the store (primary)
/// or the primary service (replica), repopulating the local cache
/// fire-and-forget on success.
pub async fn get_entry_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Response, ApiError> {
    let mode = state.mode_label();
    let cache = scoped_cache(&state, &ctx);

    match cache.get(&key).await {
        Ok(bytes) => {
            record_cache_operation("get", "hit", ctx.instance_id(), mode);
            return Ok(raw_body_response(bytes));
        }
        Err(CacheError::KeyNotFound(_)) => {}
        Err(err) => {
            record_cache_operation("get", "error", ctx.instance_id(), mode);
            return Err(ApiError::internal("cache read", &err));
        }
    }

    match state.mode() {
        DeploymentMode::Primary => {
            read_through_store(&state, &cache, &ctx, &key).await
        }
        DeploymentMode::Replica => {
            read_through_primary(&state, &cache, &ctx, &key).await
        }
    }
}

async fn read_through_store(
    state: &AppState,
    cache: &ContextCache,
    ctx: &RequestContext,
    key: &str,
) -> Result<Response, ApiError> {
    let mode = state.mode_label();
    let Some(store) = &state.store else {
        record_cache_operation("get", "miss", ctx.instance_id(), mode);
        return Err(ApiError::KeyNotFound);
    };

    let fetched = tokio::time::timeout(STORE_OP_TIMEOUT, store.get(ctx.instance_id(), key)).await;
    match fetched {
        Ok(Ok(entry)) => {
            let bytes = Bytes::from(
                serde_json::to_vec(&entry.value)
                    .map_err(|err| ApiError::internal("value encoding", &err))?,
            );
            backfill_cache(cache.clone(), key.to_string(), bytes.clone());
            record_cache_operation("get", "hit", ctx.instance_id(), mode);
            Ok(raw_body_response(bytes))
        }
        Ok(Err(StoreError::NotFound { .. })) => {
            record_cache_operation("get", "miss", ctx.instance_id(), mode);
            Err(ApiError::KeyNotFound)
        }
        Ok(Err(err)) => {
            record_cache_operation("get", "error", ctx.instance_id(), mode);
            Err(ApiError::internal("store read", &err))
        }
        Err(_) => {
            record_cache_operation("get", "error", ctx.instance_id(), mode);
            Err(ApiError::internal(
                "store read",
                &format!("timed out after {STORE_OP_TIMEOUT:?}"),
            ))
        }
    }
}

async fn read_through_primary(
    state: &AppState,
    cache: &ContextCache,
    ctx: &RequestContext,
    key: &str,
) -> Result<Response, ApiError> {
    let mode = state.mode_label();
    let Some(primary) = &state.primary else {
        record_cache_operation("get", "miss", ctx.instance_id(), mode);
        return Err(ApiError::KeyNotFound);
    };

    match primary
        .fetch(ctx.instance_id(), key, PRIMARY_FETCH_TIMEOUT)
        .await
    {
        Ok(PrimaryFetch::Found(bytes)) => {
            backfill_cache(cache.clone(), key.to_string(), bytes.clone());
            record_cache_operation("get", "hit", ctx.instance_id(), mode);
            Ok(raw_body_response(bytes))
        }
        Ok(PrimaryFetch::NotFound) => {
            record_cache_operation("get", "miss", ctx.instance_id(), mode);
            Err(ApiError::KeyNotFound)
        }
        Err(err) => {
            record_cache_operation("get", "error", ctx.instance_id(), mode);
            Err(ApiError::Upstream {
                message: err.to_string(),
            })
        }
    }
}

/// Repopulates the local cache off the request path. A fresh detached task,
/// so a disconnecting client cannot cancel it.
fn backfill_cache(cache: ContextCache, key: String, bytes: Bytes) {
    tokio::spawn(async move {
        if let Err(err) = cache.set(&key, bytes, Duration::ZERO).await {
            debug!(key, error = %err, "cache backfill failed");
        }
    });
}

/// `DELETE /v1/cache/{key}` -- remove one value.
///
/// Always answers 204. The durable delete (primary) and the forwarded
/// delete (replica) run detached.
pub async fn delete_entry_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Extension(ctx): Extension<RequestContext>,
) -> StatusCode {
    let mode = state.mode_label();
    let cache = scoped_cache(&state, &ctx);

    match cache.delete(&key).await {
        Ok(()) => record_cache_operation("delete", "success", ctx.instance_id(), mode),
        Err(err) => {
            record_cache_operation("delete", "error", ctx.instance_id(), mode);
            warn!(key, error = %err, "local cache delete failed");
        }
    }

    match state.mode() {
        DeploymentMode::Primary => {
            if let Some(store) = &state.store {
                let store = Arc::clone(store);
                let instance_id = ctx.instance_id().to_string();
                let key = key.clone();
                tokio::spawn(async move {
                    let attempt =
                        tokio::time::timeout(STORE_OP_TIMEOUT, store.delete(&instance_id, &key))
                            .await;
                    match attempt {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            warn!(key, instance_id, error = %err, "durable delete failed");
                        }
                        Err(_) => warn!(key, instance_id, "durable delete timed out"),
                    }
                });
            }
        }
        DeploymentMode::Replica => {
            if let Some(primary) = &state.primary {
                let primary = Arc::clone(primary);
                let instance_id = ctx.instance_id().to_string();
                let key = key.clone();
                tokio::spawn(async move {
                    if let Err(err) = primary.forward_delete(&instance_id, &key).await {
                        warn!(key, instance_id, error = %err, "delete forward failed");
                    }
                });
            }
        }
    }

    StatusCode::NO_CONTENT
}

/// Request body for `POST /v1/cache/batch/get`.
#[derive(Debug, Deserialize)]
pub struct BatchGetRequest {
    /// Caller-visible keys to fetch.
    pub keys: Vec<String>,
}

/// Response body for `POST /v1/cache/batch/get`.
#[derive(Debug, Serialize)]
pub struct BatchGetResponse {
    /// Values found, as JSON, keyed by the caller's keys.
    pub entries: HashMap<String, serde_json::Value>,
    /// Keys found nowhere, in request order.
    pub missing: Vec<String>,
}

/// `POST /v1/cache/batch/get` -- multi-key read.
///
/// Local cache first; on a replica, missing keys are fetched from the
/// primary one by one (there is no batch endpoint upstream) with a tight
/// per-key timeout and backfilled into the local cache.
pub async fn batch_get_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(request): Json<BatchGetRequest>,
) -> Result<Json<BatchGetResponse>, ApiError> {
    let mode = state.mode_label();
    let cache = scoped_cache(&state, &ctx);

    let found = cache.get_multiple(&request.keys).await.map_err(|err| {
        record_cache_operation("batch_get", "error", ctx.instance_id(), mode);
        ApiError::internal("cache batch read", &err)
    })?;

    let mut entries = HashMap::with_capacity(found.len());
    for (key, bytes) in found {
        let value = normalize_value(ctx.instance_id(), &key, &bytes);
        entries.insert(key, value);
    }

    let mut missing = Vec::new();
    for key in &request.keys {
        if entries.contains_key(key) {
            continue;
        }

        let mut resolved = false;
        if state.mode() == DeploymentMode::Replica {
            if let Some(primary) = &state.primary {
                match primary
                    .fetch(ctx.instance_id(), key, PRIMARY_FETCH_TIMEOUT)
                    .await
                {
                    Ok(PrimaryFetch::Found(bytes)) => {
                        backfill_cache(cache.clone(), key.clone(), bytes.clone());
                        entries.insert(key.clone(), normalize_value(ctx.instance_id(), key, &bytes));
                        resolved = true;
                    }
                    Ok(PrimaryFetch::NotFound) => {}
                    Err(err) => {
                        debug!(key, error = %err, "batch miss-read against primary failed");
                    }
                }
            }
        }
        if !resolved {
            missing.push(key.clone());
        }
    }

    let result = if missing.is_empty() { "hit" } else { "miss" };
    record_cache_operation("batch_get", result, ctx.instance_id(), mode);

    Ok(Json(BatchGetResponse { entries, missing }))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn write_timestamp_header_wins_when_parseable() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HEADER_WRITE_TIMESTAMP,
            HeaderValue::from_static("2024-01-01T00:00:00.000000002Z"),
        );
        let ts = resolve_write_timestamp(&headers);
        assert_eq!(
            warren_core::format_write_timestamp(ts),
            "2024-01-01T00:00:00.000000002Z",
        );
    }

    #[test]
    fn unparseable_write_timestamp_stamps_now() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_WRITE_TIMESTAMP, HeaderValue::from_static("garbage"));

        let before = Utc::now();
        let ts = resolve_write_timestamp(&headers);
        assert!(ts >= before && ts <= Utc::now());
    }

    #[test]
    fn source_instance_prefers_the_header_verbatim() {
        let record = warren_core::InstanceRecord::new("resolved", Utc::now());
        let ctx = RequestContext::new(record);

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_INSTANCE_ID, HeaderValue::from_static(" spaced "));
        // Verbatim: no trimming, preserving the originating replica's tag.
        assert_eq!(source_instance_id(&headers, &ctx), " spaced ");

        assert_eq!(source_instance_id(&HeaderMap::new(), &ctx), "resolved");
    }
}
