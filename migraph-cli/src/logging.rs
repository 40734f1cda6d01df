//! Logging bootstrap for the `migraph` binary.
//!
//! Diagnostics go to stderr through `tracing`; operator-facing progress is
//! printed by [`crate::output`] and is unaffected by these settings.
//!
//! # Environment Variables
//!
//! - `MIGRAPH_DEBUG=true` - Enable debug logging
//! - `MIGRAPH_LOG_LEVEL=debug|info|warn|error|trace` - Set specific log level
//! - `MIGRAPH_LOG_FORMAT=json|pretty|compact` - Set output format (default: compact)

use std::env;
use std::sync::Once;

static INIT: Once = Once::new();

/// Check if debug logging is enabled via `MIGRAPH_DEBUG`.
///
/// Returns `true` if `MIGRAPH_DEBUG` is set to "true", "1", or "yes" (case-insensitive).
#[inline]
pub fn is_debug_enabled() -> bool {
    env::var("MIGRAPH_DEBUG")
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// Get the configured log level from `MIGRAPH_LOG_LEVEL`.
///
/// Defaults to "debug" if `MIGRAPH_DEBUG` is enabled, otherwise "warn".
pub fn get_log_level() -> &'static str {
    let fallback = if is_debug_enabled() { "debug" } else { "warn" };
    match env::var("MIGRAPH_LOG_LEVEL") {
        Ok(level) => match level.to_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" => "warn",
            "error" => "error",
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

/// Get the configured log format from `MIGRAPH_LOG_FORMAT`.
pub fn get_log_format() -> &'static str {
    env::var("MIGRAPH_LOG_FORMAT")
        .map(|f| match f.to_lowercase().as_str() {
            "pretty" => "pretty",
            "json" => "json",
            _ => "compact",
        })
        .unwrap_or("compact")
}

/// Initialize logging. Subsequent calls are no-ops.
///
/// `verbose` (the `--verbose` flag) forces debug level.
pub fn init(verbose: bool) {
    INIT.call_once(|| {
        if !verbose && !is_debug_enabled() && env::var("MIGRAPH_LOG_LEVEL").is_err() {
            return;
        }

        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        let level = if verbose { "debug" } else { get_log_level() };
        let filter = EnvFilter::try_new(format!(
            "migraph={},migraph_cli={},migraph_migrate={}",
            level, level, level
        ))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

        let layer = fmt::layer().with_writer(std::io::stderr);
        match get_log_format() {
            "json" => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer.json())
                    .init();
            }
            "pretty" => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer.pretty())
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer.compact())
                    .init();
            }
        }

        tracing::debug!(level, format = get_log_format(), "migraph logging initialized");
    });
}
