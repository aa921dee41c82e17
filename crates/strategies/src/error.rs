use thiserror::Error;

#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Strategy callback failed: {0}")]
    Callback(String),

    #[error("Strategy is misconfigured: {0}")]
    Configuration(String),
}
