//! Tracing subscriber setup

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `config.level`. Fails if a subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(&config.level),
    }
    .with_context(|| format!("Invalid log filter '{}'", config.level))?;

    let builder = fmt().with_env_filter(filter).with_target(true);
    if config.json {
        builder
            .json()
            .try_init()
            .map_err(|e| anyhow!("Failed to install JSON subscriber: {}", e))
    } else {
        builder
            .try_init()
            .map_err(|e| anyhow!("Failed to install subscriber: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_reported() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "context_engine=loudest".to_string(),
            json: false,
        };
        assert!(init_tracing(&config).is_err());
    }
}
