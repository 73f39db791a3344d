//! Health, liveness, and readiness endpoints.
//!
//! `/health` is the mode-aware deep check: it pings the local cache, and on
//! a primary also inspects the async writer's queue, while a replica probes
//! the primary's own `/health`. The Kubernetes-style probes stay shallow.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde_json::json;

use super::AppState;
use crate::config::DeploymentMode;
use crate::metrics::set_health_status;

/// Timeout for the replica's probe of the primary.
const PRIMARY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Healthy,
    Degraded,
    Unhealthy,
}

impl Verdict {
    fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    fn gauge_value(self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 0.5,
            Self::Unhealthy => 0.0,
        }
    }
}

/// `GET /health` -- mode-aware deep health check.
///
/// 200 for healthy and degraded (the body tells them apart), 503 when the
/// local cache is unreachable.
pub async fn health_handler(State(state): State<AppState>) -> Response {
    let cache_ok = state.cache.ping().await.is_ok();
    let cache_label = if cache_ok { "ok" } else { "unreachable" };

    let mut body = json!({
        "mode": state.mode_label(),
        "instance_id": state.config.default_instance.clone(),
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        "state": state.shutdown.health_state().as_str(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "cache": cache_label,
    });

    let mut verdict = if cache_ok {
        Verdict::Healthy
    } else {
        Verdict::Unhealthy
    };

    match state.mode() {
        DeploymentMode::Primary => {
            if let Some(writer) = &state.writer {
                let stats = writer.stats();
                let degraded = writer.is_degraded();
                body["queue_depth"] = json!(stats.queue_depth);
                body["queue_capacity"] = json!(stats.queue_capacity);
                body["workers"] = json!(stats.worker_count);
                body["queue_degraded"] = json!(degraded);
                if degraded && verdict == Verdict::Healthy {
                    verdict = Verdict::Degraded;
                }
            }
        }
        DeploymentMode::Replica => {
            let primary_ok = match &state.primary {
                Some(primary) => primary.health(PRIMARY_PROBE_TIMEOUT).await,
                None => false,
            };
            let primary_label = if primary_ok { "ok" } else { "unreachable" };
            body["primary"] = json!(primary_label);
            if !primary_ok && verdict == Verdict::Healthy {
                // Reads still work from the local cache; writes are queued
                // against a dead upstream.
                verdict = Verdict::Degraded;
            }
        }
    }

    body["status"] = json!(verdict.as_str());
    set_health_status(
        &state.config.default_instance,
        state.mode_label(),
        verdict.gauge_value(),
    );

    let status = if verdict == Verdict::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(body)).into_response()
}

/// `GET /health/live` -- always 200 while the process is responsive.
///
/// Intentionally ignores downstream health: a failing liveness probe causes
/// a restart, which cannot fix a dead cache backend or primary.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// `GET /health/ready` -- 200 once serving, 503 while starting or draining.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
