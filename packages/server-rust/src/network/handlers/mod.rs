//! HTTP handlers and the shared application state.
//!
//! `AppState` carries `Arc` references to every long-lived component so
//! cloning it per request is cheap. Mode decides which optional parts are
//! populated: the primary wires a store and the async writer, a replica
//! wires the primary client.

pub mod cache;
pub mod health;
pub mod info;

pub use cache::{batch_get_handler, delete_entry_handler, get_entry_handler, put_entry_handler};
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use info::{metrics_handler, root_handler};

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::cache::CacheBackend;
use crate::config::{DeploymentMode, ServiceConfig};
use crate::network::ShutdownController;
use crate::registry::InstanceRegistry;
use crate::replica::PrimaryClient;
use crate::store::InstanceStore;
use crate::writer::AsyncWriter;

/// Shared application state, extracted via `State` in every handler.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration (mode, default instance, timeouts).
    pub config: Arc<ServiceConfig>,
    /// Local cache backend, present in both modes.
    pub cache: Arc<dyn CacheBackend>,
    /// Instance registry.
    pub registry: Arc<InstanceRegistry>,
    /// Durable store. Primary mode only.
    pub store: Option<Arc<dyn InstanceStore>>,
    /// Write-behind worker pool. Primary mode only.
    pub writer: Option<Arc<AsyncWriter>>,
    /// Client for the primary. Replica mode only.
    pub primary: Option<Arc<PrimaryClient>>,
    /// Graceful shutdown controller.
    pub shutdown: Arc<ShutdownController>,
    /// Prometheus render handle for `/metrics`, when a recorder is installed.
    pub metrics_handle: Option<PrometheusHandle>,
    /// Process start time, for uptime reporting.
    pub start_time: Instant,
    /// Set once the default instance has been marked permanent.
    pub default_bootstrapped: Arc<AtomicBool>,
}

impl AppState {
    /// Creates state with the parts every mode needs; attach mode-specific
    /// parts with the `with_*` builders.
    #[must_use]
    pub fn new(
        config: Arc<ServiceConfig>,
        cache: Arc<dyn CacheBackend>,
        registry: Arc<InstanceRegistry>,
    ) -> Self {
        Self {
            config,
            cache,
            registry,
            store: None,
            writer: None,
            primary: None,
            shutdown: Arc::new(ShutdownController::new()),
            metrics_handle: None,
            start_time: Instant::now(),
            default_bootstrapped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attaches the durable store (primary mode).
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attaches the async writer (primary mode).
    #[must_use]
    pub fn with_writer(mut self, writer: Arc<AsyncWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Attaches the primary client (replica mode).
    #[must_use]
    pub fn with_primary(mut self, primary: Arc<PrimaryClient>) -> Self {
        self.primary = Some(primary);
        self
    }

    /// Attaches the Prometheus render handle for `/metrics`.
    #[must_use]
    pub fn with_metrics_handle(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// The deployment role.
    #[must_use]
    pub fn mode(&self) -> DeploymentMode {
        self.config.mode
    }

    /// The role as a metric label.
    #[must_use]
    pub fn mode_label(&self) -> &'static str {
        self.config.mode.as_str()
    }
}
