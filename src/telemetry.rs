//! Tracing setup for the `docrelay` binary.
//!
//! The filter comes from `DOCRELAY_LOG`, then `RUST_LOG`, then
//! `[logging].level`. Logs go to stderr so command output on stdout stays
//! clean for scripting.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = filter_directives(config);
    let filter = EnvFilter::try_new(&filter)
        .with_context(|| format!("invalid log filter '{}'", filter))?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .context("failed to initialize tracing")?;
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .context("failed to initialize tracing")?;
    }
    Ok(())
}

fn filter_directives(config: &LoggingConfig) -> String {
    ["DOCRELAY_LOG", "RUST_LOG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|v| !v.trim().is_empty())
        .unwrap_or_else(|| config.level.clone())
}
