//! Instance middleware (T1): resolve the tenant, gate on its status, and
//! inject the request context.
//!
//! Runs on every cache route. Resolution order: `X-Instance-ID` header
//! (trimmed), `instance_id` query parameter, `instanceId` query parameter,
//! then the configured default. First contact with the default instance
//! marks its record permanent so automated cleanup can never remove it.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};
use warren_core::{RequestContext, HEADER_INSTANCE_ID};

use super::handlers::AppState;
use crate::error::{ApiError, RegistryError};

/// axum middleware wrapping all instance-scoped routes.
pub async fn resolve_instance(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let instance_id =
        instance_id_from_request(request.headers(), request.uri().query(), &state.config.default_instance);

    match resolve(&state, &instance_id).await {
        Ok(ctx) => {
            request.extensions_mut().insert(ctx);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}

/// Applies the documented resolution order for the tenant tag.
fn instance_id_from_request(headers: &HeaderMap, query: Option<&str>, default_id: &str) -> String {
    if let Some(header) = headers
        .get(HEADER_INSTANCE_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return header.to_string();
    }
    for name in ["instance_id", "instanceId"] {
        if let Some(value) = query_param(query, name) {
            return value;
        }
    }
    default_id.to_string()
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            if key != name {
                return None;
            }
            let decoded = urlencoding::decode(value)
                .map_or_else(|_| value.to_string(), |v| v.into_owned());
            Some(decoded.trim().to_string())
        })
        .filter(|v| !v.is_empty())
}

async fn resolve(state: &AppState, instance_id: &str) -> Result<RequestContext, ApiError> {
    let mut record = state
        .registry
        .get_or_create(instance_id)
        .await
        .map_err(|err| match err {
            RegistryError::NotFound(id) => ApiError::InstanceNotFound { instance_id: id },
            RegistryError::Invalid(message) => ApiError::InvalidRequest { message },
            other => ApiError::internal("instance resolution", &other),
        })?;

    // First contact with the default instance makes it permanent.
    if record.instance_id == state.config.default_instance && !record.is_permanent {
        record.is_permanent = true;
        record
            .metadata
            .insert("type".to_string(), "default".to_string());
        record
            .metadata
            .insert("created_by".to_string(), "system".to_string());

        match state.registry.update(&record).await {
            Ok(()) => {
                if !state.default_bootstrapped.swap(true, Ordering::Relaxed) {
                    info!(
                        instance_id = %record.instance_id,
                        "default instance created and marked permanent",
                    );
                }
            }
            // Keep serving; the next request retries the bootstrap.
            Err(err) => warn!(error = %err, "failed to persist default-instance bootstrap"),
        }
    }

    if !record.can_accept_requests() {
        return Err(ApiError::InstanceUnavailable {
            instance_id: record.instance_id.clone(),
            status: record.status,
        });
    }

    // Activity is best-effort and must survive client disconnects, so it
    // runs on a detached task rather than the request's own future.
    let registry = Arc::clone(&state.registry);
    let touched = record.instance_id.clone();
    tokio::spawn(async move {
        let _ = registry.update_last_active(&touched).await;
    });

    Ok(RequestContext::new(record))
}
