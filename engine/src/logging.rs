//! Tracing setup for the `plan-engine` binary.
//!
//! Diagnostics only: everything the engine must keep (status, issues, queue,
//! registry) is written as documents and is unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output goes to stderr in compact
/// format so stdout stays free for command output.
///
/// # Example
/// ```bash
/// RUST_LOG=plan_engine=debug plan-engine run --plan-id release-1
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
