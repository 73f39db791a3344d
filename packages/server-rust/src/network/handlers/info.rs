//! Service descriptor and metrics exposition endpoints.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::AppState;

/// `GET /` -- who am I and what do I serve.
pub async fn root_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "service": "warren",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": state.mode_label(),
        "default_instance": state.config.default_instance.clone(),
        "endpoints": [
            "GET /v1/cache/{key}",
            "PUT /v1/cache/{key}",
            "DELETE /v1/cache/{key}",
            "POST /v1/cache/batch/get",
            "GET /health",
            "GET /metrics",
        ],
    }))
}

/// `GET /metrics` -- Prometheus exposition text.
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::OK,
            Json(json!({"error": "metrics recorder not installed"})),
        )
            .into_response(),
    }
}
