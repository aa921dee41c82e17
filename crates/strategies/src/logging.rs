use crate::error::StrategyError;
use crate::Strategy;
use async_trait::async_trait;
use core_types::{Notice, Tick, Trade};
use tracing::info;

/// A strategy that only logs what it is called back with. Used by the paper
/// trading mode to demonstrate the delivery pipeline end to end.
pub struct LoggingStrategy {
    strategy_id: String,
}

impl LoggingStrategy {
    pub fn new(strategy_id: impl Into<String>) -> Self {
        Self {
            strategy_id: strategy_id.into(),
        }
    }
}

#[async_trait]
impl Strategy for LoggingStrategy {
    fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    async fn on_start(&mut self) -> Result<(), StrategyError> {
        info!(strategy = %self.strategy_id, "Strategy started");
        Ok(())
    }

    async fn on_tick(&mut self, tick: &Tick) -> Result<(), StrategyError> {
        info!(strategy = %self.strategy_id, instrument = %tick.instrument_id, price = %tick.last_price, "Tick");
        Ok(())
    }

    async fn on_trade(&mut self, trade: &Trade) -> Result<(), StrategyError> {
        info!(strategy = %self.strategy_id, order = %trade.order_id, volume = trade.volume, price = %trade.price, "Trade");
        Ok(())
    }

    async fn on_notice(&mut self, notice: &Notice) -> Result<(), StrategyError> {
        info!(strategy = %self.strategy_id, code = notice.code, message = %notice.message, "Notice");
        Ok(())
    }
}
