use crate::callbacks::CallbackRegistry;
use crate::context::{TransactionContext, TransactionStage};
use crate::error::EngineError;
use adapters::ExecutionEvent;
use core_types::{codes, Contract, ContractState, Notice, Order, Trade};
use persistence::Queries;
use risk::RiskAssess;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

/// Whether a fill left the order still outstanding or finished it (by
/// completion or by over-trade), in which case the tracker is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    Outstanding,
    Finished,
}

/// Per-order execution context: waits for the broker's first acknowledgement
/// and accumulates fills against the order's locked contracts.
pub struct OrderExecutionTracker {
    order: Mutex<Order>,
    contract_ids: Vec<String>,
    ctx: Arc<TransactionContext>,
    store: Arc<dyn Queries>,
    risk: Arc<dyn RiskAssess>,
    callbacks: Arc<CallbackRegistry>,
    filled: AtomicU32,
    ack_tx: std::sync::Mutex<Option<oneshot::Sender<(i32, String)>>>,
    ack_rx: std::sync::Mutex<Option<oneshot::Receiver<(i32, String)>>>,
}

impl OrderExecutionTracker {
    pub fn new(
        order: Order,
        contract_ids: Vec<String>,
        ctx: Arc<TransactionContext>,
        store: Arc<dyn Queries>,
        risk: Arc<dyn RiskAssess>,
        callbacks: Arc<CallbackRegistry>,
    ) -> Self {
        let (ack_tx, ack_rx) = oneshot::channel();
        Self {
            order: Mutex::new(order),
            contract_ids,
            ctx,
            store,
            risk,
            callbacks,
            filled: AtomicU32::new(0),
            ack_tx: std::sync::Mutex::new(Some(ack_tx)),
            ack_rx: std::sync::Mutex::new(Some(ack_rx)),
        }
    }

    /// The id of the order this tracker waits on.
    pub async fn order_id(&self) -> String {
        self.order.lock().await.id.clone()
    }

    /// Blocks until the broker's first acknowledgement for this order
    /// arrives, or the timeout elapses (which synthesizes code 3001).
    pub async fn wait_response(&self, limit: Duration) -> (i32, String) {
        let rx = self
            .ack_rx
            .lock()
            .expect("ack receiver lock poisoned")
            .take();
        let Some(rx) = rx else {
            // A second waiter is a programming fault; report it as a timeout
            // rather than hanging.
            error!("wait_response called twice on one order tracker");
            return (codes::ACK_TIMEOUT, "first response already consumed".to_string());
        };
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => (codes::ACK_TIMEOUT, "adaptor dropped the order".to_string()),
            Err(_) => (
                codes::ACK_TIMEOUT,
                format!("no broker response within {limit:?}"),
            ),
        }
    }

    /// Delivers the broker's acknowledgement into the single-slot latch.
    /// Later notices for the same order are informational only.
    pub fn on_ack(&self, code: i32, message: String) {
        let sender = self
            .ack_tx
            .lock()
            .expect("ack sender lock poisoned")
            .take();
        match sender {
            Some(tx) => {
                let _ = tx.send((code, message));
            }
            None => debug!(code, message, "Late broker notice after first ack"),
        }
    }

    /// Applies a fill: appends the trade, advances up to `trade.volume`
    /// locked contracts, runs the post-trade risk hook, and checks the order
    /// for completion or over-trade.
    pub async fn on_trade(&self, trade: &Trade) -> FillOutcome {
        if let Err(e) = self.store.insert_trade(trade.clone()).await {
            // Best-effort durability; the in-memory fill still proceeds.
            warn!(trade = %trade.id, error = %e, "Failed to persist trade");
        }

        self.advance_contracts(trade).await;

        let order = self.order.lock().await.clone();
        let filled = self.filled.fetch_add(trade.volume, Ordering::SeqCst) + trade.volume;

        self.callbacks
            .push_trade(&self.ctx.strategy_id, trade.clone())
            .await;
        self.run_after_risk(trade).await;

        if filled < order.volume {
            return FillOutcome::Outstanding;
        }

        if filled == order.volume {
            self.finish_order(&order).await;
        } else {
            // Over-trade: reported through both the risk engine and the
            // strategy, never fatal to the fill path.
            let message = format!(
                "order {} filled {} of {} lots",
                order.id, filled, order.volume
            );
            error!("{message}");
            self.risk.notice(codes::OVER_TRADE, &message);
            self.callbacks
                .push_notice(
                    &self.ctx.strategy_id,
                    Notice::for_transaction(
                        codes::OVER_TRADE,
                        message,
                        self.ctx.id.clone(),
                        Some(order.id.clone()),
                    ),
                )
                .await;
        }
        FillOutcome::Finished
    }

    /// Advances `opening -> open` or `closing -> closed` for up to
    /// `trade.volume` of this order's locked contracts. Contracts found in
    /// an unexpected state are skipped and logged; persistence failures
    /// leave the contract un-advanced so a later pass retries it.
    async fn advance_contracts(&self, trade: &Trade) {
        let is_close = self.order.lock().await.offset.is_close();
        let contracts: HashMap<String, Contract> = match self.store.select_contracts().await {
            Ok(list) => list.into_iter().map(|c| (c.id.clone(), c)).collect(),
            Err(e) => {
                warn!(error = %e, "Cannot load contracts for fill; fill retried later");
                return;
            }
        };

        let mut remaining = trade.volume;
        for id in &self.contract_ids {
            if remaining == 0 {
                break;
            }
            let Some(contract) = contracts.get(id) else {
                warn!(contract = %id, "Locked contract missing from ledger");
                continue;
            };
            let mut updated = contract.clone();
            match (is_close, contract.state) {
                (false, ContractState::Opening) => {
                    updated.state = ContractState::Open;
                    updated.price = trade.price;
                    updated.open_time = trade.update_time;
                    updated.open_trading_day = trade.trading_day.clone();
                }
                (true, ContractState::Closing) => {
                    updated.state = ContractState::Closed;
                    updated.close_price = Some(trade.price);
                }
                // Already advanced by an earlier fill of this order.
                (false, ContractState::Open) | (true, ContractState::Closed) => continue,
                (_, state) => {
                    warn!(contract = %id, ?state, "Contract in unexpected state for fill; skipped");
                    continue;
                }
            }
            match self.store.update_contract(updated).await {
                Ok(()) => remaining -= 1,
                Err(e) => {
                    warn!(contract = %id, error = %e, "Contract advance not persisted; retried on a later pass");
                }
            }
        }
        if remaining > 0 {
            warn!(
                order = %trade.order_id,
                remaining,
                "Fill volume exceeded advanceable locked contracts"
            );
        }
    }

    async fn run_after_risk(&self, trade: &Trade) {
        let transaction = self.ctx.snapshot().await;
        match self.risk.after(trade, &transaction) {
            Ok(verdict) if !verdict.is_good() => {
                self.callbacks
                    .push_notice(
                        &self.ctx.strategy_id,
                        Notice::for_transaction(
                            verdict.code,
                            verdict.message,
                            self.ctx.id.clone(),
                            Some(trade.order_id.clone()),
                        ),
                    )
                    .await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Risk engine failed in after-trade hook");
                self.callbacks
                    .push_notice(
                        &self.ctx.strategy_id,
                        Notice::for_transaction(
                            codes::RISK_FAULT,
                            format!("risk engine fault: {e}"),
                            self.ctx.id.clone(),
                            Some(trade.order_id.clone()),
                        ),
                    )
                    .await;
            }
        }
    }

    async fn finish_order(&self, order: &Order) {
        let mut updated = order.clone();
        updated.state = "all-traded".to_string();
        *self.order.lock().await = updated.clone();
        if let Err(e) = self.store.update_order(updated).await {
            warn!(order = %order.id, error = %e, "Failed to persist filled order");
        }

        if self.ctx.order_completed() && self.ctx.completion_first_time() {
            self.ctx
                .set_state(
                    self.store.as_ref(),
                    codes::state_tag("completed", codes::OK),
                    "all orders filled".to_string(),
                )
                .await;
            self.ctx.set_stage(TransactionStage::Completed);
            self.callbacks
                .push_notice(
                    &self.ctx.strategy_id,
                    Notice::for_transaction(
                        codes::OK,
                        "transaction completed",
                        self.ctx.id.clone(),
                        Some(order.id.clone()),
                    ),
                )
                .await;
        }
    }
}

/// The table of live trackers, keyed by order id.
///
/// Registering the same order id twice is a programming/adapter fault and is
/// rejected with [`EngineError::DuplicatedOrder`], never silently dropped.
#[derive(Default)]
pub struct TrackerTable {
    inner: Mutex<HashMap<String, Arc<OrderExecutionTracker>>>,
}

impl TrackerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        order_id: &str,
        tracker: Arc<OrderExecutionTracker>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        if inner.contains_key(order_id) {
            return Err(EngineError::DuplicatedOrder(order_id.to_string()));
        }
        inner.insert(order_id.to_string(), tracker);
        Ok(())
    }

    pub async fn get(&self, order_id: &str) -> Option<Arc<OrderExecutionTracker>> {
        self.inner.lock().await.get(order_id).cloned()
    }

    pub async fn remove(&self, order_id: &str) {
        self.inner.lock().await.remove(order_id);
    }
}

/// Drains the trade adaptor's event stream and routes each event to the
/// owning tracker. Runs on its own worker so the broker's network side never
/// executes strategy-adjacent logic.
pub async fn run_execution_worker(
    table: Arc<TrackerTable>,
    mut events: mpsc::UnboundedReceiver<ExecutionEvent>,
    store: Arc<dyn Queries>,
    risk: Arc<dyn RiskAssess>,
    callbacks: Arc<CallbackRegistry>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ExecutionEvent::Trade(trade) => match table.get(&trade.order_id).await {
                Some(tracker) => {
                    if tracker.on_trade(&trade).await == FillOutcome::Finished {
                        table.remove(&trade.order_id).await;
                    }
                }
                None => report_unclaimed_fill(&store, &risk, &callbacks, &trade).await,
            },
            ExecutionEvent::Notice {
                order_id,
                code,
                message,
            } => match table.get(&order_id).await {
                Some(tracker) => tracker.on_ack(code, message),
                None => warn!(order = %order_id, code, "Broker notice for unknown order"),
            },
        }
    }
    debug!("Execution event stream closed");
}

/// A fill with no live tracker is an over-trade signal (the broker executed
/// something the engine no longer expects, the double-send case included).
/// It is surfaced through the risk engine, and to the owning strategy when
/// the order is still resolvable in the ledger.
async fn report_unclaimed_fill(
    store: &Arc<dyn Queries>,
    risk: &Arc<dyn RiskAssess>,
    callbacks: &Arc<CallbackRegistry>,
    trade: &Trade,
) {
    let message = format!(
        "fill {} of {} lots for order {} with no live tracker",
        trade.id, trade.volume, trade.order_id
    );
    error!("{message}");
    risk.notice(codes::OVER_TRADE, &message);

    let order = match store.select_orders().await {
        Ok(orders) => orders.into_iter().find(|o| o.id == trade.order_id),
        Err(e) => {
            warn!(error = %e, "Cannot load orders to attribute an unclaimed fill");
            None
        }
    };
    let Some(order) = order else { return };
    let transaction = match store.select_transactions().await {
        Ok(transactions) => transactions
            .into_iter()
            .find(|t| t.id == order.transaction_id),
        Err(e) => {
            warn!(error = %e, "Cannot load transactions to attribute an unclaimed fill");
            None
        }
    };
    if let Some(transaction) = transaction {
        callbacks
            .push_notice(
                &transaction.strategy_id,
                Notice::for_transaction(
                    codes::OVER_TRADE,
                    message,
                    transaction.id,
                    Some(order.id),
                ),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use core_types::{Direction, Offset, OrderOffset, Transaction};
    use persistence::SnapshotStore;
    use risk::{PermissiveRisk, RiskError, RiskNotice};
    use rust_decimal_macros::dec;

    /// Accepts everything but remembers every coded fault it is told about.
    struct RecordingRisk {
        faults: Arc<std::sync::Mutex<Vec<(i32, String)>>>,
    }

    impl RiskAssess for RecordingRisk {
        fn before(
            &self,
            _tick: &core_types::Tick,
            _transaction: &Transaction,
        ) -> Result<RiskNotice, RiskError> {
            Ok(RiskNotice::good())
        }

        fn after(&self, _trade: &Trade, _transaction: &Transaction) -> Result<RiskNotice, RiskError> {
            Ok(RiskNotice::good())
        }

        fn notice(&self, code: i32, message: &str) {
            self.faults.lock().unwrap().push((code, message.to_string()));
        }
    }

    fn transaction() -> Transaction {
        Transaction {
            id: "1".to_string(),
            strategy_id: "s1".to_string(),
            instrument_id: "cu2409".to_string(),
            direction: Direction::Buy,
            offset: Offset::Open,
            price: dec!(1000),
            volume: 2,
            trading_day: "20260827".to_string(),
            state: "send-running".to_string(),
            state_message: String::new(),
            update_time: Utc::now(),
        }
    }

    fn order() -> Order {
        Order {
            id: "1.0".to_string(),
            transaction_id: "1".to_string(),
            instrument_id: "cu2409".to_string(),
            price: dec!(1000),
            volume: 2,
            direction: Direction::Buy,
            offset: OrderOffset::Open,
            state: "send-running".to_string(),
            trading_day: "20260827".to_string(),
        }
    }

    fn opening_contract(id: &str) -> Contract {
        Contract {
            id: id.to_string(),
            user_id: "u1".to_string(),
            instrument_id: "cu2409".to_string(),
            direction: Direction::Buy,
            price: dec!(1000),
            state: ContractState::Opening,
            open_trading_day: "20260827".to_string(),
            open_time: Utc::now(),
            close_price: None,
        }
    }

    fn fill(id: &str, volume: u32, price: rust_decimal::Decimal) -> Trade {
        Trade {
            id: id.to_string(),
            order_id: "1.0".to_string(),
            instrument_id: "cu2409".to_string(),
            price,
            volume,
            trading_day: "20260827".to_string(),
            update_time: Utc::now(),
        }
    }

    async fn build_tracker(
        store: Arc<SnapshotStore>,
    ) -> (Arc<OrderExecutionTracker>, Arc<TransactionContext>) {
        let record = transaction();
        store.insert_transaction(record.clone()).await.unwrap();
        store.insert_order(order()).await.unwrap();
        store.insert_contract(opening_contract("1.0.0")).await.unwrap();
        store.insert_contract(opening_contract("1.0.1")).await.unwrap();

        let ctx = TransactionContext::new(record);
        ctx.order_sent();
        let store_dyn: Arc<dyn Queries> = store;
        let callbacks = Arc::new(CallbackRegistry::new(
            Duration::from_millis(100),
            Duration::from_millis(100),
        ));
        let tracker = Arc::new(OrderExecutionTracker::new(
            order(),
            vec!["1.0.0".to_string(), "1.0.1".to_string()],
            Arc::clone(&ctx),
            store_dyn,
            Arc::new(PermissiveRisk),
            callbacks,
        ));
        (tracker, ctx)
    }

    #[tokio::test]
    async fn exact_fill_completes_the_order_and_transaction_once() {
        let store = Arc::new(SnapshotStore::new());
        let (tracker, ctx) = build_tracker(Arc::clone(&store)).await;

        let outcome = tracker.on_trade(&fill("f1", 2, dec!(1001))).await;
        assert_eq!(outcome, FillOutcome::Finished);
        assert_eq!(ctx.stage(), TransactionStage::Completed);
        // The completion latch was consumed exactly once.
        assert!(!ctx.completion_first_time());

        let contracts = store.select_contracts().await.unwrap();
        assert!(contracts
            .iter()
            .all(|c| c.state == ContractState::Open && c.price == dec!(1001)));
    }

    #[tokio::test]
    async fn partial_fill_leaves_the_order_outstanding() {
        let store = Arc::new(SnapshotStore::new());
        let (tracker, ctx) = build_tracker(Arc::clone(&store)).await;

        let outcome = tracker.on_trade(&fill("f1", 1, dec!(1001))).await;
        assert_eq!(outcome, FillOutcome::Outstanding);
        assert_ne!(ctx.stage(), TransactionStage::Completed);

        let advanced = store
            .select_contracts()
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.state == ContractState::Open)
            .count();
        assert_eq!(advanced, 1);
    }

    #[tokio::test]
    async fn over_trade_is_reported_without_panicking() {
        let store = Arc::new(SnapshotStore::new());
        let (tracker, ctx) = build_tracker(Arc::clone(&store)).await;

        assert_eq!(
            tracker.on_trade(&fill("f1", 2, dec!(1001))).await,
            FillOutcome::Finished
        );
        // A simulated double-send beyond the ordered volume.
        assert_eq!(
            tracker.on_trade(&fill("f2", 1, dec!(1002))).await,
            FillOutcome::Finished
        );
        // The transaction completed exactly once despite the extra fill.
        assert_eq!(ctx.stage(), TransactionStage::Completed);
    }

    #[tokio::test]
    async fn missing_first_ack_times_out_with_3001() {
        let store = Arc::new(SnapshotStore::new());
        let (tracker, _ctx) = build_tracker(store).await;

        let (code, message) = tracker.wait_response(Duration::from_millis(50)).await;
        assert_eq!(code, codes::ACK_TIMEOUT);
        assert!(message.contains("no broker response"));
    }

    #[tokio::test]
    async fn unclaimed_fill_is_reported_to_risk_engine_and_strategy() {
        let store = Arc::new(SnapshotStore::new());
        store.insert_transaction(transaction()).await.unwrap();
        store.insert_order(order()).await.unwrap();

        let faults = Arc::new(std::sync::Mutex::new(Vec::new()));
        let risk: Arc<dyn RiskAssess> = Arc::new(RecordingRisk {
            faults: Arc::clone(&faults),
        });
        let store_dyn: Arc<dyn Queries> = store;
        let callbacks = Arc::new(CallbackRegistry::new(
            Duration::from_millis(100),
            Duration::from_millis(100),
        ));

        // No tracker registered for "1.0": the fill arrives after teardown.
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_execution_worker(
            Arc::new(TrackerTable::new()),
            events_rx,
            store_dyn,
            Arc::clone(&risk),
            callbacks,
        ));
        events_tx
            .send(ExecutionEvent::Trade(fill("f9", 1, dec!(1000))))
            .unwrap();
        drop(events_tx);
        worker.await.unwrap();

        let faults = faults.lock().unwrap().clone();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].0, codes::OVER_TRADE);
        assert!(faults[0].1.contains("1.0"));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let store = Arc::new(SnapshotStore::new());
        let (tracker, _ctx) = build_tracker(Arc::clone(&store)).await;
        let table = TrackerTable::new();

        table.register("1.0", Arc::clone(&tracker)).await.unwrap();
        let err = table.register("1.0", tracker).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicatedOrder(id) if id == "1.0"));
    }
}
