//! Tracing subscriber setup for processes embedding Recall.
//!
//! The library itself only emits `tracing` events; the orchestration layer
//! calls [`init`] once at startup to decide where they go.

use tracing_subscriber::EnvFilter;

use crate::config::{GeneralConfig, LogFormat};
use crate::error::{RecallError, Result};

/// Build the level filter: `RUST_LOG` wins, otherwise the configured level.
pub fn env_filter(config: &GeneralConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|e| {
            RecallError::Config(format!("invalid log_level {:?}: {}", config.log_level, e))
        }),
    }
}

/// Install the global subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init(config: &GeneralConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let installed = match config.log_format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init(),
    };
    installed.map_err(|e| RecallError::Config(format!("failed to install subscriber: {}", e)))
}
