//! Network layer: axum router, middleware stack, instance resolution, and
//! the graceful-shutdown lifecycle.

pub mod config;
pub mod handlers;
pub mod instance;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::{NetworkConfig, TlsConfig};
pub use module::{build_router, NetworkModule};
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
