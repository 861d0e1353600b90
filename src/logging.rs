//! Tracing subscriber setup.
//!
//! Logs go to stderr so that command output on stdout stays parseable.
//! The filter comes from `RUST_LOG` when set, else from `[logging].filter`,
//! else `tos_monitor=info`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const DEFAULT_FILTER: &str = "tos_monitor=info,tosmon=info";

static INIT_ONCE: Once = Once::new();

fn filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = config.filter.as_deref().unwrap_or(DEFAULT_FILTER);
        EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    })
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &LoggingConfig) {
    INIT_ONCE.call_once(|| {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter(config))
            .with_writer(std::io::stderr);
        // try_init: a test harness may already have installed a subscriber.
        let _ = match config.format.as_str() {
            "json" => builder.json().try_init(),
            _ => builder.try_init(),
        };
    });
}
