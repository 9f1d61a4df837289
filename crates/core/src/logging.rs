//! Structured logging infrastructure for mesh nodes and tooling.
//!
//! Log level can be configured via the `RUST_LOG` environment variable.
//! If not set, defaults to `info` level.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the logging system with human-readable structured output.
///
/// # Example
/// ```no_run
/// use credmesh_core::logging;
///
/// logging::init();
/// tracing::info!("Mesh node started");
/// ```
pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize the logging system with JSON output, one object per line.
///
/// # Example
/// ```no_run
/// use credmesh_core::logging;
///
/// logging::init_json();
/// tracing::info!(tenant = "tenant-alpha", "Mesh node started");
/// ```
pub fn init_json() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .init();
}

/// Try to install a compact subscriber for tests. Repeated calls are no-ops.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_test_writer())
        .try_init();
}
