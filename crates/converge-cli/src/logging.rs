//! Installs the global tracing subscriber and bridges `log` records into it.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::LogFormat;

pub fn init(level: &str, format: LogFormat) -> Result<()> {
    // RUST_LOG wins over the flag.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_current_span(true)),
        ),
        LogFormat::Text => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(false)))
        }
    }
    .context("Failed to install tracing subscriber")?;

    tracing_log::LogTracer::init().context("Failed to bridge log records")?;
    Ok(())
}
