//! # Meridian Configuration
//!
//! Typed application settings, loaded from `meridian.toml`. Every tunable the
//! execution core consumes (queue capacities, acknowledgement timeout,
//! callback budgets, tick staleness threshold) lives here so the engine can be
//! constructed from explicit values rather than global state.

use crate::error::ConfigError;
use crate::settings::Config;

// Declare the modules that make up this crate.
pub mod error;
pub mod settings;

// Re-export the core types to provide a clean public API.
pub use settings::{Callbacks, Market, Runtime, Scheduler};

/// Loads the application configuration from the `meridian.toml` file.
///
/// This function is the primary entry point for this crate. It reads the
/// configuration file, deserializes it into our strongly-typed `Config`
/// struct, and returns it.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from("meridian")
}

/// Loads configuration from an explicit file stem, used by tests and by the
/// CLI's `--config` flag.
pub fn load_config_from(name: &str) -> Result<Config, ConfigError> {
    let builder = config::Config::builder()
        .add_source(config::File::with_name(name))
        .build()?;

    let config = builder.try_deserialize::<Config>()?;

    Ok(config)
}
