//! Network configuration for the HTTP server.

use std::path::PathBuf;
use std::time::Duration;

/// Bind, TLS, and transport-middleware settings.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Optional TLS configuration; plain HTTP when absent.
    pub tls: Option<TlsConfig>,
    /// Allowed CORS origins. `"*"` anywhere in the list allows any origin.
    pub cors_origins: Vec<String>,
    /// Maximum time one inbound request may take end to end.
    pub request_timeout: Duration,
    /// How long shutdown waits for in-flight requests to drain.
    pub shutdown_timeout: Duration,
    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            tls: None,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// TLS certificate configuration.
///
/// No `Default` impl because certificate paths have no sensible defaults.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file.
    pub cert_path: PathBuf,
    /// Path to the TLS private key file.
    pub key_path: PathBuf,
}
