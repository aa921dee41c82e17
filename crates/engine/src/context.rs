use chrono::Utc;
use core_types::{Order, Tick, Transaction};
use persistence::Queries;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::warn;

/// The coarse position of a transaction in its lifecycle, broadcast to
/// anyone blocked in [`TransactionContext::join`].
///
/// The persisted record keeps the fine-grained free-text state tag; this
/// enum only distinguishes what schedulers and joiners need to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStage {
    /// Awaiting a qualifying tick (or a retry of a parked order).
    Pending,
    /// Armed and sitting in the scheduler's FIFO queue.
    Queueing,
    /// Accepted by the broker; fills outstanding.
    SendRunning,
    /// Every order filled in full.
    Completed,
    /// Terminally failed with the embedded code.
    Aborted(i32),
}

impl TransactionStage {
    /// True once `join` should unblock.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStage::Completed | TransactionStage::Aborted(_))
    }
}

/// An order parked for resend after a "market closed" reject, together with
/// the contracts it still holds locked.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub order: Order,
    pub contract_ids: Vec<String>,
}

/// The shared execution context of one transaction: the mutable record, the
/// stage broadcast, the tick that armed it, and any orders parked for
/// resend.
///
/// Handed to the strategy as the return value of `open`/`close`; `join`
/// blocks the caller until the transaction reaches a terminal stage.
pub struct TransactionContext {
    pub id: String,
    pub strategy_id: String,
    pub instrument_id: String,
    record: Mutex<Transaction>,
    stage_tx: watch::Sender<TransactionStage>,
    triggering_tick: Mutex<Option<Tick>>,
    pending_orders: Mutex<Vec<PendingOrder>>,
    live_orders: AtomicU32,
    completion_sent: AtomicBool,
}

impl TransactionContext {
    pub fn new(record: Transaction) -> Arc<Self> {
        let (stage_tx, _) = watch::channel(TransactionStage::Pending);
        Arc::new(Self {
            id: record.id.clone(),
            strategy_id: record.strategy_id.clone(),
            instrument_id: record.instrument_id.clone(),
            record: Mutex::new(record),
            stage_tx,
            triggering_tick: Mutex::new(None),
            pending_orders: Mutex::new(Vec::new()),
            live_orders: AtomicU32::new(0),
            completion_sent: AtomicBool::new(false),
        })
    }

    /// A point-in-time copy of the persisted record.
    pub async fn snapshot(&self) -> Transaction {
        self.record.lock().await.clone()
    }

    /// The current lifecycle stage.
    pub fn stage(&self) -> TransactionStage {
        *self.stage_tx.borrow()
    }

    /// Moves the lifecycle stage; joiners observe the change immediately.
    pub fn set_stage(&self, stage: TransactionStage) {
        self.stage_tx.send_replace(stage);
    }

    /// Moves the lifecycle stage unless a terminal stage was already
    /// reached. An early fill can complete the transaction while the
    /// scheduler is still waiting on the broker acknowledgement; that
    /// completion must not be overwritten.
    pub fn advance_stage(&self, stage: TransactionStage) {
        self.stage_tx.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = stage;
                true
            }
        });
    }

    /// Updates the record's state tag and persists it. Persistence failures
    /// are logged and absorbed; the in-memory tag always advances.
    pub async fn set_state(&self, store: &dyn Queries, state: String, message: String) {
        let snapshot = {
            let mut record = self.record.lock().await;
            record.state = state;
            record.state_message = message;
            record.update_time = Utc::now();
            record.clone()
        };
        if let Err(e) = store.update_transaction(snapshot).await {
            warn!(transaction = %self.id, error = %e, "Failed to persist transaction state");
        }
    }

    /// Like `set_state`, but only while the transaction is still live: once
    /// the completion latch has flipped or a terminal stage is reached the
    /// record is left alone. Returns whether the update was applied.
    pub async fn set_state_if_active(
        &self,
        store: &dyn Queries,
        state: String,
        message: String,
    ) -> bool {
        let snapshot = {
            let mut record = self.record.lock().await;
            if self.completion_sent.load(Ordering::SeqCst) || self.stage().is_terminal() {
                return false;
            }
            record.state = state;
            record.state_message = message;
            record.update_time = Utc::now();
            record.clone()
        };
        if let Err(e) = store.update_transaction(snapshot).await {
            warn!(transaction = %self.id, error = %e, "Failed to persist transaction state");
        }
        true
    }

    /// Stores the tick that armed this transaction.
    pub async fn set_triggering_tick(&self, tick: Tick) {
        *self.triggering_tick.lock().await = Some(tick);
    }

    /// The tick that armed this transaction, if it has been armed.
    pub async fn triggering_tick(&self) -> Option<Tick> {
        self.triggering_tick.lock().await.clone()
    }

    /// Parks an order (and its locked contracts) for resend on the next
    /// qualifying tick.
    pub async fn park_order(&self, parked: PendingOrder) {
        self.pending_orders.lock().await.push(parked);
    }

    /// Takes every parked order for resend.
    pub async fn take_parked_orders(&self) -> Vec<PendingOrder> {
        std::mem::take(&mut *self.pending_orders.lock().await)
    }

    /// True when the transaction has orders awaiting resend.
    pub async fn has_parked_orders(&self) -> bool {
        !self.pending_orders.lock().await.is_empty()
    }

    /// Registers one more live (accepted, unfilled) order.
    pub fn order_sent(&self) {
        self.live_orders.fetch_add(1, Ordering::SeqCst);
    }

    /// Compensates `order_sent` for an order that was parked or aborted
    /// before acceptance.
    pub fn order_abandoned(&self) {
        self.live_orders.fetch_sub(1, Ordering::SeqCst);
    }

    /// Marks one live order as fully filled; returns true when it was the
    /// last one and the whole transaction is complete.
    pub fn order_completed(&self) -> bool {
        self.live_orders.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Flips the once-only completion latch; true on the first call.
    pub fn completion_first_time(&self) -> bool {
        !self.completion_sent.swap(true, Ordering::SeqCst)
    }

    /// Blocks until the transaction reaches a terminal stage, then returns
    /// that stage together with a snapshot of the record.
    pub async fn join(&self) -> (TransactionStage, Transaction) {
        let mut rx = self.stage_tx.subscribe();
        let stage = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(stage) => *stage,
            // The sender lives inside self, so this arm is unreachable in
            // practice; treat it as an abort if it ever happens.
            Err(_) => TransactionStage::Aborted(-1),
        };
        (stage, self.record.lock().await.clone())
    }
}

/// Monotonic id source for transactions, orders, and contracts.
///
/// Order ids extend their transaction id (`<transaction>.<n>`); contract ids
/// extend their order id (`<order>.<i>`), which keeps ownership legible in
/// logs and snapshots.
#[derive(Debug, Default)]
pub struct IdSource {
    transaction_seq: AtomicU64,
}

impl IdSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the generator past ids already present in a restored ledger.
    pub fn seed(&self, floor: u64) {
        self.transaction_seq.fetch_max(floor, Ordering::SeqCst);
    }

    pub fn next_transaction_id(&self) -> String {
        let seq = self.transaction_seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{seq}")
    }

    pub fn order_id(transaction_id: &str, ordinal: u32) -> String {
        format!("{transaction_id}.{ordinal}")
    }

    pub fn contract_id(order_id: &str, ordinal: u32) -> String {
        format!("{order_id}.{ordinal}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{Direction, Offset};
    use rust_decimal::Decimal;

    fn record(id: &str) -> Transaction {
        Transaction {
            id: id.to_string(),
            strategy_id: "s1".to_string(),
            instrument_id: "cu2409".to_string(),
            direction: Direction::Buy,
            offset: Offset::Open,
            price: Decimal::ONE,
            volume: 1,
            trading_day: "20260827".to_string(),
            state: "pending;never enqueued".to_string(),
            state_message: String::new(),
            update_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn join_unblocks_on_terminal_stage() {
        let ctx = TransactionContext::new(record("t1"));
        let joiner = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.join().await })
        };

        ctx.set_stage(TransactionStage::Queueing);
        ctx.set_stage(TransactionStage::Aborted(1003));

        let (stage, _) = joiner.await.unwrap();
        assert_eq!(stage, TransactionStage::Aborted(1003));
    }

    #[tokio::test]
    async fn completion_latch_fires_once() {
        let ctx = TransactionContext::new(record("t2"));
        assert!(ctx.completion_first_time());
        assert!(!ctx.completion_first_time());
    }

    #[test]
    fn id_source_extends_ids_hierarchically() {
        let ids = IdSource::new();
        let tx = ids.next_transaction_id();
        assert_eq!(tx, "1");
        let order = IdSource::order_id(&tx, 0);
        assert_eq!(order, "1.0");
        assert_eq!(IdSource::contract_id(&order, 1), "1.0.1");
    }
}
