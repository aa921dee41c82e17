use core_types::{codes, Bar, Notice, Tick, Trade};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strategies::Strategy;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// One unit of work on a strategy's callback queue.
#[derive(Debug, Clone)]
pub enum CallbackItem {
    Tick(Tick),
    Bar(Bar),
    Trade(Trade),
    Notice(Notice),
    Start,
    Stop,
    Destroy,
}

impl CallbackItem {
    fn is_market_data(&self) -> bool {
        matches!(self, CallbackItem::Tick(_) | CallbackItem::Bar(_))
    }

    fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            CallbackItem::Start | CallbackItem::Stop | CallbackItem::Destroy
        )
    }

    fn name(&self) -> &'static str {
        match self {
            CallbackItem::Tick(_) => "on_tick",
            CallbackItem::Bar(_) => "on_bar",
            CallbackItem::Trade(_) => "on_trade",
            CallbackItem::Notice(_) => "on_notice",
            CallbackItem::Start => "on_start",
            CallbackItem::Stop => "on_stop",
            CallbackItem::Destroy => "on_destroy",
        }
    }
}

/// The engine-side handle of one strategy's serialized callback queue.
struct StrategyHandle {
    sender: mpsc::UnboundedSender<CallbackItem>,
    is_shutdown: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

/// One single-consumer queue per strategy, decoupling market/trade/notice
/// producers from user strategy code.
///
/// Callback execution is bounded in time: market-data/trade/notice callbacks
/// get the data budget, lifecycle callbacks the lifecycle budget. Overruns
/// are cancelled and reported as code-4002 notices; callback errors become
/// code-4001 notices unless the failing callback was itself the notice
/// callback (which would recurse).
pub struct CallbackRegistry {
    data_budget: Duration,
    lifecycle_budget: Duration,
    handles: Mutex<HashMap<String, StrategyHandle>>,
}

impl CallbackRegistry {
    pub fn new(data_budget: Duration, lifecycle_budget: Duration) -> Self {
        Self {
            data_budget,
            lifecycle_budget,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a strategy, spawns its queue consumer, and queues the
    /// `on_start` lifecycle callback.
    pub async fn register(&self, strategy_id: &str, strategy: Arc<Mutex<dyn Strategy>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let is_shutdown = Arc::new(AtomicBool::new(false));
        let worker = tokio::spawn(drain_queue(
            strategy_id.to_string(),
            strategy,
            receiver,
            sender.clone(),
            Arc::clone(&is_shutdown),
            self.data_budget,
            self.lifecycle_budget,
        ));
        let _ = sender.send(CallbackItem::Start);
        let handle = StrategyHandle {
            sender,
            is_shutdown,
            worker,
        };
        if let Some(old) = self.handles.lock().await.insert(strategy_id.to_string(), handle) {
            warn!(strategy = strategy_id, "Replacing an existing callback queue");
            old.worker.abort();
        }
    }

    /// Queues a tick. Dropped at the door while the strategy is shut down.
    pub async fn push_tick(&self, strategy_id: &str, tick: Tick) {
        self.push_market_data(strategy_id, CallbackItem::Tick(tick)).await;
    }

    /// Queues a bar. Dropped at the door while the strategy is shut down.
    pub async fn push_bar(&self, strategy_id: &str, bar: Bar) {
        self.push_market_data(strategy_id, CallbackItem::Bar(bar)).await;
    }

    async fn push_market_data(&self, strategy_id: &str, item: CallbackItem) {
        let handles = self.handles.lock().await;
        if let Some(handle) = handles.get(strategy_id) {
            if handle.is_shutdown.load(Ordering::SeqCst) {
                return;
            }
            let _ = handle.sender.send(item);
        }
    }

    /// Queues a trade. Delivered even while the strategy is shut down, so
    /// outstanding transactions can still complete and be accounted for.
    pub async fn push_trade(&self, strategy_id: &str, trade: Trade) {
        self.push_always(strategy_id, CallbackItem::Trade(trade)).await;
    }

    /// Queues a notice. Delivered even while the strategy is shut down.
    pub async fn push_notice(&self, strategy_id: &str, notice: Notice) {
        self.push_always(strategy_id, CallbackItem::Notice(notice)).await;
    }

    async fn push_always(&self, strategy_id: &str, item: CallbackItem) {
        let handles = self.handles.lock().await;
        match handles.get(strategy_id) {
            Some(handle) => {
                let _ = handle.sender.send(item);
            }
            None => warn!(
                strategy = strategy_id,
                item = item.name(),
                "Dropping callback for unregistered strategy"
            ),
        }
    }

    /// Shuts a strategy down: ticks/bars stop being queued, `on_stop` is
    /// delivered, trades and notices keep flowing.
    pub async fn shutdown(&self, strategy_id: &str) {
        let handles = self.handles.lock().await;
        if let Some(handle) = handles.get(strategy_id) {
            handle.is_shutdown.store(true, Ordering::SeqCst);
            let _ = handle.sender.send(CallbackItem::Stop);
        }
    }

    /// Removes a strategy for good: `on_destroy` is delivered, then the queue
    /// consumer exits.
    pub async fn destroy(&self, strategy_id: &str) {
        if let Some(handle) = self.handles.lock().await.remove(strategy_id) {
            handle.is_shutdown.store(true, Ordering::SeqCst);
            let _ = handle.sender.send(CallbackItem::Destroy);
        }
    }

    /// Destroys every registered strategy, used at engine shutdown.
    pub async fn destroy_all(&self) {
        let ids: Vec<String> = self.handles.lock().await.keys().cloned().collect();
        for id in ids {
            self.destroy(&id).await;
        }
    }
}

/// The queue consumer: dequeues items one at a time and dispatches each
/// through a bounded-time execution, so a hung callback cannot stall the
/// strategy's queue for longer than its budget.
async fn drain_queue(
    strategy_id: String,
    strategy: Arc<Mutex<dyn Strategy>>,
    mut receiver: mpsc::UnboundedReceiver<CallbackItem>,
    feedback: mpsc::UnboundedSender<CallbackItem>,
    is_shutdown: Arc<AtomicBool>,
    data_budget: Duration,
    lifecycle_budget: Duration,
) {
    while let Some(item) = receiver.recv().await {
        // Items queued before a shutdown flipped the flag are dropped here.
        if item.is_market_data() && is_shutdown.load(Ordering::SeqCst) {
            continue;
        }
        let budget = if item.is_lifecycle() {
            lifecycle_budget
        } else {
            data_budget
        };
        let is_destroy = matches!(item, CallbackItem::Destroy);
        let is_notice = matches!(item, CallbackItem::Notice(_));
        let name = item.name();

        let outcome = timeout(budget, invoke(&strategy, &item)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(strategy = %strategy_id, callback = name, error = %e, "Strategy callback failed");
                // A failing notice callback must not feed itself more
                // notices.
                if !is_notice {
                    let _ = feedback.send(CallbackItem::Notice(Notice::new(
                        codes::CALLBACK_FAULT,
                        format!("{name} failed: {e}"),
                    )));
                }
            }
            Err(_) => {
                warn!(strategy = %strategy_id, callback = name, budget = ?budget, "Strategy callback timed out and was cancelled");
                if !is_notice {
                    let _ = feedback.send(CallbackItem::Notice(Notice::new(
                        codes::CALLBACK_TIMEOUT,
                        format!("{name} exceeded its {budget:?} budget"),
                    )));
                }
            }
        }

        if is_destroy {
            debug!(strategy = %strategy_id, "Callback queue destroyed");
            break;
        }
    }
}

async fn invoke(
    strategy: &Arc<Mutex<dyn Strategy>>,
    item: &CallbackItem,
) -> Result<(), strategies::StrategyError> {
    let mut strategy = strategy.lock().await;
    match item {
        CallbackItem::Tick(tick) => strategy.on_tick(tick).await,
        CallbackItem::Bar(bar) => strategy.on_bar(bar).await,
        CallbackItem::Trade(trade) => strategy.on_trade(trade).await,
        CallbackItem::Notice(notice) => strategy.on_notice(notice).await,
        CallbackItem::Start => strategy.on_start().await,
        CallbackItem::Stop => strategy.on_stop().await,
        CallbackItem::Destroy => strategy.on_destroy().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use strategies::StrategyError;

    /// Records every callback it receives; optionally sleeps or fails.
    struct Probe {
        events: Arc<std::sync::Mutex<Vec<String>>>,
        sleep_on_tick: Option<Duration>,
        fail_on_trade: bool,
    }

    impl Probe {
        fn new() -> (Self, Arc<std::sync::Mutex<Vec<String>>>) {
            let events = Arc::new(std::sync::Mutex::new(Vec::new()));
            (
                Self {
                    events: Arc::clone(&events),
                    sleep_on_tick: None,
                    fail_on_trade: false,
                },
                events,
            )
        }

        fn record(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }
    }

    #[async_trait]
    impl Strategy for Probe {
        fn strategy_id(&self) -> &str {
            "probe"
        }

        async fn on_start(&mut self) -> Result<(), StrategyError> {
            self.record("start");
            Ok(())
        }

        async fn on_tick(&mut self, tick: &Tick) -> Result<(), StrategyError> {
            if let Some(nap) = self.sleep_on_tick {
                tokio::time::sleep(nap).await;
            }
            self.record(format!("tick:{}", tick.last_price));
            Ok(())
        }

        async fn on_trade(&mut self, trade: &Trade) -> Result<(), StrategyError> {
            if self.fail_on_trade {
                return Err(StrategyError::Callback("boom".to_string()));
            }
            self.record(format!("trade:{}", trade.id));
            Ok(())
        }

        async fn on_notice(&mut self, notice: &Notice) -> Result<(), StrategyError> {
            self.record(format!("notice:{}", notice.code));
            Ok(())
        }
    }

    fn tick(price: i64) -> Tick {
        Tick {
            instrument_id: "cu2409".to_string(),
            last_price: rust_decimal::Decimal::from(price),
            update_time: Utc::now(),
        }
    }

    fn trade(id: &str) -> Trade {
        Trade {
            id: id.to_string(),
            order_id: "1.0".to_string(),
            instrument_id: "cu2409".to_string(),
            price: dec!(1000),
            volume: 1,
            trading_day: "20260827".to_string(),
            update_time: Utc::now(),
        }
    }

    async fn settle_queue() {
        // Give the queue consumer a chance to drain.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn overrunning_callback_yields_4002_and_queue_keeps_moving() {
        let registry = CallbackRegistry::new(Duration::from_millis(50), Duration::from_millis(200));
        let (mut probe, events) = Probe::new();
        probe.sleep_on_tick = Some(Duration::from_millis(500));
        registry.register("probe", Arc::new(Mutex::new(probe))).await;

        registry.push_tick("probe", tick(1)).await;
        registry.push_trade("probe", trade("f1")).await;
        tokio::time::sleep(Duration::from_millis(700)).await;

        let events = events.lock().unwrap().clone();
        // The slow tick was cancelled, the trade behind it still ran, and
        // the timeout notice came through the same queue.
        assert!(!events.iter().any(|e| e.starts_with("tick")));
        assert!(events.contains(&"trade:f1".to_string()));
        assert!(events.contains(&format!("notice:{}", codes::CALLBACK_TIMEOUT)));
    }

    #[tokio::test]
    async fn failing_callback_yields_4001() {
        let registry = CallbackRegistry::new(Duration::from_millis(100), Duration::from_millis(200));
        let (mut probe, events) = Probe::new();
        probe.fail_on_trade = true;
        registry.register("probe", Arc::new(Mutex::new(probe))).await;

        registry.push_trade("probe", trade("f1")).await;
        settle_queue().await;

        let events = events.lock().unwrap().clone();
        assert!(events.contains(&format!("notice:{}", codes::CALLBACK_FAULT)));
    }

    #[tokio::test]
    async fn shutdown_drops_market_data_but_delivers_trades_and_notices() {
        let registry = CallbackRegistry::new(Duration::from_millis(100), Duration::from_millis(200));
        let (probe, events) = Probe::new();
        registry.register("probe", Arc::new(Mutex::new(probe))).await;

        registry.shutdown("probe").await;
        registry.push_tick("probe", tick(2)).await;
        registry.push_trade("probe", trade("f2")).await;
        registry
            .push_notice("probe", Notice::new(codes::OK, "completed"))
            .await;
        settle_queue().await;

        let events = events.lock().unwrap().clone();
        assert!(!events.iter().any(|e| e.starts_with("tick")));
        assert!(events.contains(&"trade:f2".to_string()));
        assert!(events.contains(&"notice:0".to_string()));
    }
}
