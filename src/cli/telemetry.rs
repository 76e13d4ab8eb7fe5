//! Logging initialization: `tracing-subscriber` fmt with an env filter.
//!
//! `RUST_LOG` wins when set; otherwise the `-v` count picks the level and the
//! default is INFO.

use anyhow::{Result, anyhow};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// # Errors
///
/// Returns an error when a global subscriber is already installed.
pub fn init(level: Option<Level>) -> Result<()> {
    let fallback = level.map_or_else(|| "info".to_string(), |l| l.to_string().to_lowercase());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize logging: {e}"))
}
