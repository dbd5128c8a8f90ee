//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level, so
//! `RUST_LOG=pico_daq=trace` shows every frame without touching the config.

use crate::config::LoggingConfig;
use crate::error::{PicoError, PicoResult};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber described by `config`.
///
/// # Errors
///
/// Returns `PicoError::Validation` if a global subscriber is already set.
pub fn init(config: &LoggingConfig) -> PicoResult<()> {
    let filter = env_filter(config);
    let result = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };
    result.map_err(|e| PicoError::Validation(format!("Logging already initialised: {}", e)))
}

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}
