//! Tower middleware for the HTTP surface.
//!
//! Two kinds live here: the transport-level stack (request ids, tracing,
//! compression, CORS, timeout, body limit) applied to the whole router, and
//! the request-scoped axum middlewares (latency metrics, in-flight
//! tracking) applied inside it.

use std::time::Instant;

use axum::body::Body;
use axum::extract::{MatchedPath, Request, State};
use axum::http::header::HeaderName;
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::map_response_body::MapResponseBodyLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use warren_core::RequestContext;

use super::config::NetworkConfig;
use super::handlers::AppState;
use crate::metrics;

/// Applies the transport-level stack, outermost to innermost:
///
/// 1. `SetRequestId` -- stamps a UUID v4 `X-Request-Id` on every request
/// 2. `Trace` -- structured request/response spans
/// 3. `Compression` -- gzip response bodies
/// 4. `CORS` -- from the configured origin list
/// 5. `Timeout` -- bounds total request processing time
/// 6. `RequestBodyLimit` -- caps inbound payload size
/// 7. `PropagateRequestId` -- copies the id onto the response
#[must_use]
pub fn apply_http_layers(router: Router, config: &NetworkConfig) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");
    let cors = build_cors_layer(&config.cors_origins);

    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .layer(CompressionLayer::new())
            .layer(cors)
            .layer(TimeoutLayer::with_status_code(
                axum::http::StatusCode::REQUEST_TIMEOUT,
                config.request_timeout,
            ))
            .layer(MapResponseBodyLayer::new(Body::new))
            .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
            .layer(PropagateRequestIdLayer::new(x_request_id)),
    )
}

/// Builds the CORS layer from the configured origin list; a `"*"` entry
/// allows any origin.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| o.parse().ok()))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
}

/// Records `request_duration_seconds` for every request that reaches the
/// cache routes. Runs inside the instance middleware so the resolved tenant
/// is available in the request extensions.
pub async fn record_request_metrics(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path().to_string(), |p| p.as_str().to_string());
    let instance_id = request
        .extensions()
        .get::<RequestContext>()
        .map_or_else(|| state.config.default_instance.clone(), |ctx| {
            ctx.instance_id().to_string()
        });

    let response = next.run(request).await;

    metrics::record_request_duration(
        &method,
        &endpoint,
        response.status().as_u16(),
        &instance_id,
        state.mode_label(),
        start.elapsed().as_secs_f64(),
    );
    response
}

/// Registers every request with the shutdown controller so drain can wait
/// for real completion.
pub async fn track_in_flight(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let _guard = state.shutdown.in_flight_guard();
    next.run(request).await
}
