//! Development-time tracing for debugging autoloop.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of autoloop product output.
//!
//! - **Iteration logging (`io/iteration_log`)**: Product artifacts in
//!   `.autoloop/iterations/`, plus `.autoloop/summary.md`. Always written,
//!   unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format. Stdout stays reserved for JSON results.
///
/// # Example
/// ```bash
/// RUST_LOG=autoloop=debug autoloop supervise
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
