//! Logging setup
//!
//! Output always goes to stderr: a plugin served over stdio owns stdout for
//! frames.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives, e.g. `snapwire=debug`.
pub const LOG_ENV: &str = "SNAPWIRE_LOG";

/// Install the global fmt subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

/// Re-emit a log line received from a plugin at the matching level.
pub(crate) fn emit_plugin_log(call_id: u64, level: &str, message: &str) {
    match level {
        "error" => tracing::error!(target: "snapwire::plugin", call_id, "{}", message),
        "warn" | "warning" => tracing::warn!(target: "snapwire::plugin", call_id, "{}", message),
        "debug" => tracing::debug!(target: "snapwire::plugin", call_id, "{}", message),
        "trace" => tracing::trace!(target: "snapwire::plugin", call_id, "{}", message),
        _ => tracing::info!(target: "snapwire::plugin", call_id, "{}", message),
    }
}
