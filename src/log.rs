//! Structured logging setup.
//!
//! Log levels:
//! - ERROR: failures that abort a workflow
//! - WARN: recoverable anomalies (dropped cycle edges, fallbacks, failed probes)
//! - INFO: pass and batch boundaries
//! - DEBUG: per-task scheduling and dispatch decisions
//!
//! Debug mode can be enabled with `--debug` or `TASKWEAVE_DEBUG=1`. A full
//! filter directive in `TASKWEAVE_LOG` (e.g. `taskweave=trace`) overrides
//! both.

use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "TASKWEAVE_LOG";

/// Environment variable enabling debug output.
pub const DEBUG_ENV: &str = "TASKWEAVE_DEBUG";

/// Whether `TASKWEAVE_DEBUG` requests debug output.
pub fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|value| is_truthy(&value))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

/// Build the filter used by [`init`].
pub fn filter(debug: bool) -> EnvFilter {
    let fallback = default_directive(debug || debug_from_env());
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global subscriber, writing to stderr. Subsequent calls are
/// no-ops.
pub fn init(debug: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(debug))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
