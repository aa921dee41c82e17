use crate::error::AdaptorError;
use crate::traits::{ExecutionEvent, MarketAdaptor, TradeAdaptor};
use async_trait::async_trait;
use chrono::Utc;
use core_types::{Order, Tick, Trade};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// The "virtual broker" for paper trading and tests.
///
/// Every `require` is acknowledged with a configurable code; accepted orders
/// are optionally filled in full at their submitted price. Tests that need
/// finer control (partial fills, double fills, delayed acks) push events
/// through [`SimTradeAdaptor::injector`] instead.
pub struct SimTradeAdaptor {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ExecutionEvent>>>,
    ack_code: AtomicI32,
    auto_fill: AtomicBool,
    trade_seq: AtomicU64,
}

impl SimTradeAdaptor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            ack_code: AtomicI32::new(0),
            auto_fill: AtomicBool::new(true),
            trade_seq: AtomicU64::new(0),
        }
    }

    /// Sets the code every subsequent order is acknowledged with.
    pub fn set_ack_code(&self, code: i32) {
        self.ack_code.store(code, Ordering::SeqCst);
    }

    /// Enables or disables full automatic fills for accepted orders.
    pub fn set_auto_fill(&self, enabled: bool) {
        self.auto_fill.store(enabled, Ordering::SeqCst);
    }

    /// A sender that pushes raw events onto the adaptor's stream, for tests
    /// that script broker behavior by hand.
    pub fn injector(&self) -> mpsc::UnboundedSender<ExecutionEvent> {
        self.tx.clone()
    }

    fn next_trade_id(&self) -> String {
        let seq = self.trade_seq.fetch_add(1, Ordering::SeqCst);
        format!("sim-trade-{seq}")
    }
}

impl Default for SimTradeAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradeAdaptor for SimTradeAdaptor {
    async fn start(&self) -> Result<(), AdaptorError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), AdaptorError> {
        Ok(())
    }

    async fn require(&self, order: &Order) -> Result<(), AdaptorError> {
        let code = self.ack_code.load(Ordering::SeqCst);
        debug!(order_id = %order.id, code, "Sim broker acknowledging order");
        let ack = ExecutionEvent::Notice {
            order_id: order.id.clone(),
            code,
            message: if code == 0 {
                "order accepted".to_string()
            } else {
                format!("order rejected with code {code}")
            },
        };
        self.tx
            .send(ack)
            .map_err(|e| AdaptorError::OrderEntry(e.to_string()))?;

        if code == 0 && self.auto_fill.load(Ordering::SeqCst) {
            let fill = ExecutionEvent::Trade(Trade {
                id: self.next_trade_id(),
                order_id: order.id.clone(),
                instrument_id: order.instrument_id.clone(),
                price: order.price,
                volume: order.volume,
                trading_day: order.trading_day.clone(),
                update_time: Utc::now(),
            });
            self.tx
                .send(fill)
                .map_err(|e| AdaptorError::OrderEntry(e.to_string()))?;
        }
        Ok(())
    }

    async fn cancel(&self, order_id: &str) -> Result<(), AdaptorError> {
        debug!(order_id, "Sim broker ignoring cancel request");
        Ok(())
    }

    fn events(&self) -> Result<mpsc::UnboundedReceiver<ExecutionEvent>, AdaptorError> {
        self.rx
            .lock()
            .expect("sim adaptor receiver lock poisoned")
            .take()
            .ok_or(AdaptorError::EventStreamTaken)
    }
}

/// A scripted market-data feed: tests and the paper-trading mode push ticks,
/// the engine consumes them like any live feed.
pub struct SimMarketAdaptor {
    tx: mpsc::UnboundedSender<Tick>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Tick>>>,
    subscribed: Mutex<HashSet<String>>,
}

impl SimMarketAdaptor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            subscribed: Mutex::new(HashSet::new()),
        }
    }

    /// Pushes a tick onto the feed.
    pub fn push(&self, tick: Tick) {
        // Send failure just means the engine side hung up; the feed is done.
        let _ = self.tx.send(tick);
    }

    /// The set of instruments the engine has registered with the feed.
    pub fn subscribed(&self) -> HashSet<String> {
        self.subscribed
            .lock()
            .expect("sim feed subscription lock poisoned")
            .clone()
    }

    /// Forgets every registered instrument, simulating a reconnect.
    pub fn clear_subscribed(&self) {
        self.subscribed
            .lock()
            .expect("sim feed subscription lock poisoned")
            .clear();
    }
}

impl Default for SimMarketAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketAdaptor for SimMarketAdaptor {
    async fn start(&self) -> Result<(), AdaptorError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), AdaptorError> {
        Ok(())
    }

    async fn add(&self, instrument_id: &str) -> Result<(), AdaptorError> {
        self.subscribed
            .lock()
            .expect("sim feed subscription lock poisoned")
            .insert(instrument_id.to_string());
        Ok(())
    }

    fn ticks(&self) -> Result<mpsc::UnboundedReceiver<Tick>, AdaptorError> {
        self.rx
            .lock()
            .expect("sim feed receiver lock poisoned")
            .take()
            .ok_or(AdaptorError::EventStreamTaken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{Direction, OrderOffset};
    use rust_decimal_macros::dec;

    fn order() -> Order {
        Order {
            id: "t1.0".to_string(),
            transaction_id: "t1".to_string(),
            instrument_id: "cu2409".to_string(),
            price: dec!(1000),
            volume: 2,
            direction: Direction::Buy,
            offset: OrderOffset::Open,
            state: "created".to_string(),
            trading_day: "20260827".to_string(),
        }
    }

    #[tokio::test]
    async fn accepted_order_yields_ack_then_full_fill() {
        let adaptor = SimTradeAdaptor::new();
        let mut events = adaptor.events().unwrap();

        adaptor.require(&order()).await.unwrap();

        match events.recv().await.unwrap() {
            ExecutionEvent::Notice { order_id, code, .. } => {
                assert_eq!(order_id, "t1.0");
                assert_eq!(code, 0);
            }
            other => panic!("expected ack, got {other:?}"),
        }
        match events.recv().await.unwrap() {
            ExecutionEvent::Trade(trade) => {
                assert_eq!(trade.order_id, "t1.0");
                assert_eq!(trade.volume, 2);
                assert_eq!(trade.price, dec!(1000));
            }
            other => panic!("expected fill, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_order_yields_ack_only() {
        let adaptor = SimTradeAdaptor::new();
        adaptor.set_ack_code(10001);
        let mut events = adaptor.events().unwrap();

        adaptor.require(&order()).await.unwrap();

        match events.recv().await.unwrap() {
            ExecutionEvent::Notice { code, .. } => assert_eq!(code, 10001),
            other => panic!("expected ack, got {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn event_stream_can_only_be_taken_once() {
        let adaptor = SimTradeAdaptor::new();
        let _events = adaptor.events().unwrap();
        assert!(matches!(
            adaptor.events(),
            Err(AdaptorError::EventStreamTaken)
        ));
    }
}
