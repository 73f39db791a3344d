//! Network module with the deferred-startup lifecycle.
//!
//! `new()` wires the router state, `start()` binds the TCP listener, and
//! `serve()` runs until the shutdown future resolves. Splitting bind from
//! serve lets the binary report the real port (port 0 deployments, tests)
//! and wire background services between the two steps.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    batch_get_handler, delete_entry_handler, get_entry_handler, health_handler, liveness_handler,
    metrics_handler, put_entry_handler, readiness_handler, root_handler, AppState,
};
use super::instance::resolve_instance;
use super::middleware::{apply_http_layers, record_request_metrics, track_in_flight};
use super::shutdown::ShutdownController;

/// Assembles the full router: cache routes behind the instance middleware,
/// operational routes outside it, transport layers around everything.
#[must_use]
pub fn build_router(state: AppState, network: &NetworkConfig) -> Router {
    let cache_routes = Router::new()
        .route(
            "/v1/cache/{key}",
            get(get_entry_handler)
                .put(put_entry_handler)
                .post(put_entry_handler)
                .delete(delete_entry_handler),
        )
        .route("/v1/cache/batch/get", post(batch_get_handler))
        // Inner-to-outer: metrics sees the resolved instance, the instance
        // middleware runs first.
        .layer(from_fn_with_state(state.clone(), record_request_metrics))
        .layer(from_fn_with_state(state.clone(), resolve_instance));

    let router = Router::new()
        .merge(cache_routes)
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/", get(root_handler))
        .layer(from_fn_with_state(state.clone(), track_in_flight))
        .with_state(state);

    apply_http_layers(router, network)
}

/// Owns the HTTP server lifecycle.
pub struct NetworkModule {
    network: NetworkConfig,
    state: AppState,
    listener: Option<TcpListener>,
}

impl NetworkModule {
    /// Creates the module without binding a port.
    #[must_use]
    pub fn new(network: NetworkConfig, state: AppState) -> Self {
        Self {
            network,
            state,
            listener: None,
        }
    }

    /// The shared shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.state.shutdown)
    }

    /// Binds the listener, returning the actual port (relevant with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error when the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.network.host, self.network.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        info!(host = %self.network.host, port, "listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns an error on fatal I/O failures or missing TLS material.
    ///
    /// # Panics
    ///
    /// Panics when called before [`start`](Self::start).
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .expect("start() must be called before serve()");
        let controller = Arc::clone(&self.state.shutdown);
        let drain_budget = self.network.shutdown_timeout;

        let router = build_router(self.state, &self.network);
        controller.set_ready();

        if let Some(tls) = self.network.tls {
            serve_tls(listener, router, &tls, shutdown).await?;
        } else {
            info!("serving plain HTTP");
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await?;
        }

        drain(&controller, drain_budget).await;
        Ok(())
    }
}

async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &super::config::TlsConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(|err| anyhow::anyhow!("loading TLS material: {err}"))?;

    let addr = listener.local_addr()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!(%addr, "serving TLS");
    axum_server::from_tcp_rustls(listener.into_std()?, rustls)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}

async fn drain(controller: &ShutdownController, budget: Duration) {
    controller.trigger_shutdown();
    if controller.wait_for_drain(budget).await {
        info!("all in-flight requests drained");
    } else {
        warn!(
            in_flight = controller.in_flight_count(),
            "drain budget expired with requests still in flight",
        );
    }
}
