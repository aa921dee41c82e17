use crate::error::AdaptorError;
use async_trait::async_trait;
use core_types::{Order, Tick, Trade};
use tokio::sync::mpsc;

/// An asynchronous event pushed by the broker after an order was submitted.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// A fill against a previously submitted order.
    Trade(Trade),
    /// A coded acknowledgement for an order: code 0 accepts, anything else
    /// rejects (10001 meaning "market closed", which the scheduler retries).
    Notice {
        order_id: String,
        code: i32,
        message: String,
    },
}

/// The broker's order-entry interface.
#[async_trait]
pub trait TradeAdaptor: Send + Sync {
    /// Connects the adaptor to its broker front-end.
    async fn start(&self) -> Result<(), AdaptorError>;

    /// Disconnects and releases broker resources.
    async fn shutdown(&self) -> Result<(), AdaptorError>;

    /// Submits an order. Fire-and-forget: the acknowledgement arrives later
    /// on the event stream as an [`ExecutionEvent::Notice`].
    async fn require(&self, order: &Order) -> Result<(), AdaptorError>;

    /// Requests cancellation of a previously submitted order.
    async fn cancel(&self, order_id: &str) -> Result<(), AdaptorError>;

    /// Takes the adaptor's event stream. May be taken exactly once; a second
    /// call fails with [`AdaptorError::EventStreamTaken`].
    fn events(&self) -> Result<mpsc::UnboundedReceiver<ExecutionEvent>, AdaptorError>;
}

/// The market-data front-end interface.
#[async_trait]
pub trait MarketAdaptor: Send + Sync {
    /// Connects the adaptor to its feed.
    async fn start(&self) -> Result<(), AdaptorError>;

    /// Disconnects from the feed.
    async fn shutdown(&self) -> Result<(), AdaptorError>;

    /// Registers a feed-level subscription for an instrument.
    async fn add(&self, instrument_id: &str) -> Result<(), AdaptorError>;

    /// Takes the adaptor's tick stream. May be taken exactly once.
    fn ticks(&self) -> Result<mpsc::UnboundedReceiver<Tick>, AdaptorError>;
}
