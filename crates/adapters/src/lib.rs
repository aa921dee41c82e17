//! # Meridian Adapters
//!
//! The broker boundary. [`TradeAdaptor`] carries orders out to the broker and
//! streams acknowledgements and fills back in; [`MarketAdaptor`] registers
//! tick subscriptions and streams ticks back in. Both are abstract traits so
//! the engine never knows whether it is talking to a real broker front-end or
//! to the in-process simulators.
//!
//! ## Architectural Principles
//!
//! - **Channels as listeners:** Asynchronous callbacks from the broker are
//!   modeled as tokio channels the engine drains on its own workers, so no
//!   broker network thread ever runs engine logic directly.
//! - **Fire-and-forget submit:** `require` returns as soon as the order is
//!   handed to the broker; the acknowledgement arrives later as an
//!   [`ExecutionEvent::Notice`] keyed by order id.

// Declare the modules that constitute this crate.
pub mod error;
pub mod sim;
pub mod traits;

// Re-export the key components to provide a clean, public-facing API.
pub use error::AdaptorError;
pub use sim::{SimMarketAdaptor, SimTradeAdaptor};
pub use traits::{ExecutionEvent, MarketAdaptor, TradeAdaptor};
