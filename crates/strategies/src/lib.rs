//! # Meridian Strategy Library
//!
//! This crate defines the capability interface user strategies implement. It
//! replaces annotation scanning and runtime method lookup with an explicit
//! trait bound once at strategy construction: the engine calls the methods a
//! strategy chose to override, and the default bodies ignore everything else.
//!
//! ## Architectural Principles
//!
//! - **Layer 1 Logic:** This is a pure logic crate. It has no knowledge of
//!   the scheduler, persistence, or adapters; it depends only on
//!   `core-types`.
//! - **Bounded callbacks:** Every callback is async so the engine can cancel
//!   it when it overruns its execution budget. A callback that blocks the
//!   thread instead of awaiting defeats that protection.

use async_trait::async_trait;
use core_types::{Bar, Notice, Tick, Trade};

// Declare the modules that constitute this crate.
pub mod error;
pub mod logging;

// Re-export the key components to create a clean, public-facing API.
pub use error::StrategyError;
pub use logging::LoggingStrategy;

/// The callbacks a strategy can receive. All have default no-op bodies; a
/// strategy overrides the ones it cares about.
///
/// The `&mut self` receivers are serialized by the per-strategy callback
/// queue, so implementations never see concurrent calls.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// The unique id this strategy is registered under.
    fn strategy_id(&self) -> &str;

    /// Called once after the strategy's queue starts draining.
    async fn on_start(&mut self) -> Result<(), StrategyError> {
        Ok(())
    }

    /// Called when the strategy is shut down; outstanding trades and notices
    /// still arrive afterwards so open transactions can complete.
    async fn on_stop(&mut self) -> Result<(), StrategyError> {
        Ok(())
    }

    /// Called when the strategy is being removed for good.
    async fn on_destroy(&mut self) -> Result<(), StrategyError> {
        Ok(())
    }

    /// A tick for one of the strategy's subscribed instruments.
    async fn on_tick(&mut self, _tick: &Tick) -> Result<(), StrategyError> {
        Ok(())
    }

    /// An aggregated bar for one of the strategy's subscribed instruments.
    async fn on_bar(&mut self, _bar: &Bar) -> Result<(), StrategyError> {
        Ok(())
    }

    /// A fill against one of the strategy's orders.
    async fn on_trade(&mut self, _trade: &Trade) -> Result<(), StrategyError> {
        Ok(())
    }

    /// A coded notice about one of the strategy's transactions.
    async fn on_notice(&mut self, _notice: &Notice) -> Result<(), StrategyError> {
        Ok(())
    }
}
