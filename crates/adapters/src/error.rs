use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdaptorError {
    #[error("The adaptor is not connected: {0}")]
    NotConnected(String),

    #[error("The adaptor's event stream was already taken.")]
    EventStreamTaken,

    #[error("Order entry failed: {0}")]
    OrderEntry(String),

    #[error("Subscription failed for instrument '{0}': {1}")]
    Subscription(String, String),
}
