//! Log subscriber setup.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from the configured
//! level. Output is human-readable by default and JSON on request.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::LoggingError;

/// Install the global subscriber
///
/// Fails if the filter does not parse or a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(config)?;

    if config.json {
        let layer = fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true);
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
            .map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))
    } else {
        let layer = fmt::layer()
            .with_target(false)
            .with_thread_ids(false);
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
            .map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))
    }
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| LoggingError::Filter(e.to_string()))
}
