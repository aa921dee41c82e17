use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or parse the configuration file: {0}")]
    File(#[from] config::ConfigError),

    #[error("Configuration value is invalid: {0}")]
    Invalid(String),
}
