//! Diagnostic tracing for the engine.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, written to stderr.
//!   Not persisted and not part of the operator-facing report.
//!
//! - **Attempt logs (`io/attempt_log`)**: product artifacts under
//!   `<git-dir>/splitstack/runs/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the filter is `warn`, or
/// `splitstack=debug` with `verbose`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=splitstack::io::git=debug splitstack --yes
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "warn,splitstack=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
