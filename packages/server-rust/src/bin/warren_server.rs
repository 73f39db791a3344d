//! Warren server binary: configuration, wiring, and lifecycle.
//!
//! Assembles the mode-appropriate component graph -- primary gets the
//! durable store, async writer, and cleanup loop; replica gets the primary
//! client -- then hands the listener to the network module until a shutdown
//! signal arrives.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warren_server::archive::{ArchiveSink, FsArchive};
use warren_server::cache::{CacheBackend, MemoryCache};
use warren_server::cleanup::{CleanupConfig, CleanupService, LogNotifier};
use warren_server::config::{DeploymentMode, ServiceConfig};
use warren_server::lifecycle::LifecycleManager;
use warren_server::network::handlers::AppState;
use warren_server::network::{NetworkConfig, NetworkModule};
use warren_server::registry::{InstanceRegistry, RegistryConfig};
use warren_server::replica::PrimaryClient;
use warren_server::store::{InstanceStore, MemoryStore};
use warren_server::writer::{AsyncWriter, AsyncWriterConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(ServiceConfig::parse());
    config.validate()?;

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| anyhow::anyhow!("installing metrics recorder: {err}"))?;

    let cache: Arc<MemoryCache> =
        Arc::new(MemoryCache::with_default_ttl(config.cache_default_ttl()));
    let registry = Arc::new(InstanceRegistry::new(
        cache.clone(),
        RegistryConfig::default(),
    ));

    let mut state = AppState::new(Arc::clone(&config), cache.clone(), registry.clone())
        .with_metrics_handle(prometheus);
    let mut writer: Option<Arc<AsyncWriter>> = None;
    let mut cleanup_task = None;

    match config.mode {
        DeploymentMode::Primary => {
            let store = build_store(&config).await?;

            let pool = Arc::new(AsyncWriter::new(
                store.clone(),
                AsyncWriterConfig {
                    queue_size: config.async_queue_size,
                    workers: config.async_workers,
                    metrics_instance: config.default_instance.clone(),
                    ..AsyncWriterConfig::default()
                },
            ));
            writer = Some(pool.clone());
            state = state.with_store(store.clone()).with_writer(pool);

            let lifecycle = Arc::new(LifecycleManager::new(
                registry.clone(),
                store.clone(),
                cache.clone(),
            ));
            let archive = config.archive_dir.as_ref().map(|dir| {
                info!(dir = %dir.display(), "archive sink: filesystem");
                Arc::new(FsArchive::new(dir.clone())) as Arc<dyn ArchiveSink>
            });
            if config.archive_enabled && archive.is_none() {
                warn!("archival enabled without an archive directory; cleanup will delete without dumps");
            }

            let cleanup = Arc::new(CleanupService::new(
                registry,
                lifecycle,
                Some(store),
                archive,
                Some(Arc::new(LogNotifier)),
                CleanupConfig {
                    interval: config.cleanup_interval(),
                    minimum_age: chrono_secs(config.cleanup_minimum_age_secs),
                    inactivity_timeout: chrono_secs(config.cleanup_inactivity_secs),
                    archive_enabled: config.archive_enabled,
                    dry_run: config.cleanup_dry_run,
                    ..CleanupConfig::default()
                },
            ));
            let shutdown_rx = state.shutdown.subscribe();
            cleanup_task = Some(tokio::spawn(async move { cleanup.run(shutdown_rx).await }));
        }
        DeploymentMode::Replica => {
            let Some(url) = &config.primary_url else {
                anyhow::bail!("replica mode requires a primary URL");
            };
            let client = PrimaryClient::new(url, Duration::from_secs(10))
                .map_err(|err| anyhow::anyhow!("building primary client: {err}"))?;
            info!(primary = %url, "forwarding writes and miss-reads upstream");
            state = state.with_primary(Arc::new(client));
        }
    }

    let network = NetworkConfig {
        host: config.host.clone(),
        port: config.port,
        request_timeout: config.request_timeout(),
        shutdown_timeout: config.shutdown_timeout(),
        ..NetworkConfig::default()
    };

    let mut module = NetworkModule::new(network, state);
    let port = module.start().await?;
    info!(mode = %config.mode, port, default_instance = %config.default_instance, "warren ready");

    module.serve(shutdown_signal()).await?;

    // Teardown order: stop accepting writes, drain the queue, then close
    // the backends.
    if let Some(writer) = writer {
        if tokio::time::timeout(config.shutdown_timeout(), writer.shutdown())
            .await
            .is_err()
        {
            warn!("async writer did not drain within the shutdown budget");
        }
    }
    if let Some(task) = cleanup_task {
        let _ = task.await;
    }
    if let Err(err) = cache.close().await {
        warn!(error = %err, "cache backend close failed");
    }

    info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn chrono_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

/// Selects the durable store: PostgreSQL when configured and compiled in,
/// the in-memory store otherwise.
async fn build_store(config: &ServiceConfig) -> anyhow::Result<Arc<dyn InstanceStore>> {
    #[cfg(feature = "postgres")]
    {
        if let Some(url) = &config.database_url {
            let store = warren_server::store::PostgresStore::connect(url, 10)
                .await
                .map_err(|err| anyhow::anyhow!("connecting to postgres: {err}"))?;
            info!("durable store: postgres");
            return Ok(Arc::new(store));
        }
    }

    #[cfg(not(feature = "postgres"))]
    {
        if config.database_url.is_some() {
            warn!("WARREN_DATABASE_URL is set but this build lacks the postgres feature; using the in-memory store");
        }
    }

    info!("durable store: in-memory");
    Ok(Arc::new(MemoryStore::new()))
}

/// Resolves on SIGINT or (on unix) SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing the SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing the SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
