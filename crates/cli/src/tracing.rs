use anyhow::{Context, Result};
use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

const DEFAULT_FILTER: &str = "warn";

/// Setup tracing + log integration
///
/// Logs go to stderr so job output on stdout stays clean. `RUST_LOG`
/// overrides the default filter.
pub fn setup_logging() -> Result<()> {
    LogTracer::init().context("Failed to set LogTracer")?;
    let fmt_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}
