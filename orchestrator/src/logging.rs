//! Operator diagnostics via `tracing`.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: stage attempts, delays and outcomes, filtered by
//!   `RUST_LOG`, written to stderr. Not persisted.
//!
//! - **Run journal (`io/journal`)**: product record in `.orchestrator/runs/`.
//!   Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `info` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=orchestrator=debug orchestrator drain --workers 4
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
