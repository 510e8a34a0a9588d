use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingSection;

/// Install the global fmt subscriber. `RUST_LOG` wins over the configured
/// level when set, so a noisy module can be silenced without a config edit.
pub fn init(section: &LoggingSection) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&section.level))
        .context("building log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}
