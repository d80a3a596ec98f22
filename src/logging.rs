//! Structured logging setup.

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Install the global tracing subscriber, honoring `level` unless `DIRSYNC_LOG_LEVEL` overrides it.
pub fn init(level: LevelFilter) -> Result<()> {
    let filter = EnvFilter::try_from_env("DIRSYNC_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let stdout = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(stdout)
        .with(filter)
        .try_init()
        .context("init tracing registry")?;

    tracing::info!("log level set to {level}");
    Ok(())
}
