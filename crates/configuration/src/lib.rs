//! # Sentinel Configuration
//!
//! Strongly-typed settings for every component, loaded from an optional TOML
//! file with environment-variable overrides, plus the shared logging setup.
//!
//! Environment variables use the `SENTINEL` prefix and `__` as the section
//! separator, e.g. `SENTINEL__SCHEDULER__PERIOD_SECS=30`.

use crate::error::ConfigError;
use std::path::Path;

// Declare the modules that make up this crate.
pub mod error;
pub mod logging;
pub mod settings;

// Re-export the core types to provide a clean public API.
pub use logging::init_tracing;
pub use settings::{
    Config, DatabaseConfig, ExchangeConfig, LoggingConfig, RetryConfig, SchedulerConfig, SignalsConfig,
    StoreBackend, TelegramConfig, TradingConfig,
};

/// Loads and validates the application configuration.
///
/// The file is optional: a missing `path` leaves every section at its default,
/// which environment variables can still override.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let builder = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix("SENTINEL")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?;

    let config = builder.try_deserialize::<Config>()?;
    config.validate()?;

    Ok(config)
}
