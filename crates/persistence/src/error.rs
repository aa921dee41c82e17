use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("An entity with id '{0}' already exists in table '{1}'.")]
    Duplicate(String, String),

    #[error("No entity with id '{0}' was found in table '{1}'.")]
    NotFound(String, String),

    #[error("Snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("An error occurred during JSON serialization/deserialization: {0}")]
    Json(#[from] serde_json::Error),
}
