//! Service configuration: every knob is both a CLI flag and an environment
//! variable, parsed with clap.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

/// Which role this process plays in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeploymentMode {
    /// Owns the durable store and the async writer.
    Primary,
    /// Holds a local read cache; forwards writes and miss-reads upstream.
    Replica,
}

impl DeploymentMode {
    /// Lowercase string form, used for metric labels and health bodies.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Replica => "replica",
        }
    }

    /// Whether this process owns the durable store.
    #[must_use]
    pub fn is_primary(self) -> bool {
        self == Self::Primary
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level service configuration.
///
/// Parsed from flags and `WARREN_*` environment variables; see each field's
/// `env` attribute for the variable name.
#[derive(Debug, Clone, Parser)]
#[command(name = "warren-server", about = "Multi-tenant persistent cache service")]
pub struct ServiceConfig {
    /// Deployment role.
    #[arg(long, env = "WARREN_MODE", value_enum, default_value_t = DeploymentMode::Primary)]
    pub mode: DeploymentMode,

    /// Instance id assumed when a request carries none. Permanent after
    /// bootstrap.
    #[arg(long, env = "WARREN_DEFAULT_INSTANCE", default_value = "global")]
    pub default_instance: String,

    /// Base URL of the primary. Required in replica mode.
    #[arg(long, env = "WARREN_PRIMARY_URL")]
    pub primary_url: Option<String>,

    /// Async writer queue capacity.
    #[arg(long, env = "WARREN_ASYNC_QUEUE_SIZE", default_value_t = 10_000)]
    pub async_queue_size: usize,

    /// Async writer worker count.
    #[arg(long, env = "WARREN_ASYNC_WORKERS", default_value_t = 5)]
    pub async_workers: usize,

    /// Inbound request timeout in seconds.
    #[arg(long, env = "WARREN_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Graceful-shutdown drain budget in seconds.
    #[arg(long, env = "WARREN_SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Cleanup cadence in seconds.
    #[arg(long, env = "WARREN_CLEANUP_INTERVAL_SECS", default_value_t = 300)]
    pub cleanup_interval_secs: u64,

    /// Minimum instance age before cleanup may delete it, in seconds.
    #[arg(long, env = "WARREN_CLEANUP_MIN_AGE_SECS", default_value_t = 1800)]
    pub cleanup_minimum_age_secs: u64,

    /// Minimum inactivity before cleanup may delete an instance, in seconds.
    #[arg(long, env = "WARREN_CLEANUP_INACTIVITY_SECS", default_value_t = 1800)]
    pub cleanup_inactivity_secs: u64,

    /// Archive instances to the configured sink before cleanup deletes them.
    #[arg(long, env = "WARREN_ARCHIVE_ENABLED", default_value_t = false)]
    pub archive_enabled: bool,

    /// Root directory for the filesystem archive sink.
    #[arg(long, env = "WARREN_ARCHIVE_DIR")]
    pub archive_dir: Option<PathBuf>,

    /// Log cleanup intent without archiving or deleting anything.
    #[arg(long, env = "WARREN_CLEANUP_DRY_RUN", default_value_t = false)]
    pub cleanup_dry_run: bool,

    /// Bind address.
    #[arg(long, env = "WARREN_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Bind port. 0 means OS-assigned.
    #[arg(long, env = "WARREN_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Default TTL for cache entries written with "backend default", in
    /// seconds. 0 means entries never expire.
    #[arg(long, env = "WARREN_CACHE_DEFAULT_TTL_SECS", default_value_t = 0)]
    pub cache_default_ttl_secs: u64,

    /// PostgreSQL connection URL for the durable store (primary mode,
    /// `postgres` build). Unset selects the in-memory store.
    #[arg(long, env = "WARREN_DATABASE_URL")]
    pub database_url: Option<String>,
}

impl ServiceConfig {
    /// Checks mode-dependent requirements.
    ///
    /// # Errors
    ///
    /// Returns an error for a replica without a primary URL or an empty
    /// default instance id.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_instance.trim().is_empty() {
            anyhow::bail!("default instance id must not be empty");
        }
        if self.mode == DeploymentMode::Replica && self.primary_url.is_none() {
            anyhow::bail!("replica mode requires --primary-url / WARREN_PRIMARY_URL");
        }
        Ok(())
    }

    /// Inbound request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Graceful-shutdown drain budget.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Cleanup cadence.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Default cache TTL, or `None` when entries should never expire.
    #[must_use]
    pub fn cache_default_ttl(&self) -> Option<Duration> {
        (self.cache_default_ttl_secs > 0)
            .then(|| Duration::from_secs(self.cache_default_ttl_secs))
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::Primary,
            default_instance: "global".to_string(),
            primary_url: None,
            async_queue_size: 10_000,
            async_workers: 5,
            request_timeout_secs: 30,
            shutdown_timeout_secs: 30,
            cleanup_interval_secs: 300,
            cleanup_minimum_age_secs: 1800,
            cleanup_inactivity_secs: 1800,
            archive_enabled: false,
            archive_dir: None,
            cleanup_dry_run: false,
            host: "0.0.0.0".to_string(),
            port: 8080,
            cache_default_ttl_secs: 0,
            database_url: None,
        }
    }
}
