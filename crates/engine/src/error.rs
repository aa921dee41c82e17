use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Order id '{0}' is already registered for execution tracking.")]
    DuplicatedOrder(String),

    #[error("No strategy with id '{0}' is registered with the engine.")]
    StrategyNotFound(String),

    #[error("Persistence error: {0}")]
    Store(#[from] persistence::StoreError),

    #[error("Adaptor error: {0}")]
    Adaptor(#[from] adapters::AdaptorError),

    #[error("Risk engine error: {0}")]
    Risk(#[from] risk::RiskError),

    #[error("The engine is shut down or a worker is unavailable: {0}")]
    Unavailable(String),
}
