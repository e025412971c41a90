//! Logging setup.
//!
//! The container logs through `tracing`, and logging is configured from the
//! same string map as every other subsystem: `container.log.format` selects
//! `text` (default) or `json`, `container.log.filter` supplies the filter
//! directives used when `RUST_LOG` is unset. Invalid values are setup-time
//! errors naming the key.
//!
//! Initialization happens once, in the container entry after the config map
//! is parsed. When an embedder has already installed a subscriber the call
//! quietly yields to it.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{Config, Error, Result};

const LOG_FORMAT: &str = "container.log.format";
const LOG_FILTER: &str = "container.log.filter";

/// Install the process subscriber according to config.
pub fn init_logging(config: &Config) -> Result<()> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .or_else(|| config.get(LOG_FILTER).map(str::to_string))
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_new(&directives).map_err(|e| {
        Error::config(LOG_FILTER, format!("invalid filter '{}': {}", directives, e))
    })?;

    let builder = fmt().with_env_filter(filter).with_target(false);
    let installed = match config.get(LOG_FORMAT) {
        None | Some("text") => builder.try_init().is_ok(),
        Some("json") => builder.json().try_init().is_ok(),
        Some(other) => {
            return Err(Error::config(
                LOG_FORMAT,
                format!("expected 'text' or 'json', got '{}'", other),
            ))
        }
    };
    if !installed {
        tracing::debug!("subscriber already installed, leaving it in place");
    }
    Ok(())
}
