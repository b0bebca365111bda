//! Development-time tracing for debugging the fetcher.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of fetcher product output.
//!
//! - **Agent log (`io/log_sink`)**: The session narrative (generated code,
//!   verdicts, retries). Written to `log.file` when configured, unaffected by
//!   `RUST_LOG`.
//!
//! - **Session traces (`io/session_trace`)**: Per-attempt artifacts under
//!   `log.trace_dir`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=fetcher=debug cargo run -- run --query "AAPL close last week"
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
