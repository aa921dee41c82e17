use crate::callbacks::CallbackRegistry;
use crate::context::{IdSource, PendingOrder, TransactionContext, TransactionStage};
use crate::error::EngineError;
use crate::tracker::{OrderExecutionTracker, TrackerTable};
use adapters::TradeAdaptor;
use chrono::Utc;
use core_types::{
    codes, Contract, ContractState, Direction, Notice, Offset, Order, OrderOffset, Tick,
    Transaction,
};
use persistence::Queries;
use risk::RiskAssess;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// How a single order submission ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubmitOutcome {
    /// Broker accepted; fills outstanding.
    Accepted,
    /// Broker said market closed (10001); the order is parked for resend.
    Parked,
    /// Rejected, timed out, or faulted; the transaction was aborted.
    Aborted,
}

/// The transaction state machine: a single logical worker drains the armed
/// queue in FIFO order, while a pending set holds transactions awaiting
/// either a qualifying tick or a retry of a parked order.
///
/// Processing a transaction includes a blocking wait for the broker's first
/// acknowledgement (bounded by the ack timeout), an explicit trade-off
/// favoring simplicity over pipelining.
pub struct TransactionScheduler {
    store: Arc<dyn Queries>,
    trade: Arc<dyn TradeAdaptor>,
    risk: Arc<dyn RiskAssess>,
    trackers: Arc<TrackerTable>,
    callbacks: Arc<CallbackRegistry>,
    trading_day: String,
    ack_timeout: Duration,
    ids: IdSource,
    pending: Mutex<HashMap<String, Arc<TransactionContext>>>,
    interrupts: Mutex<HashMap<String, Arc<AtomicBool>>>,
    armed_tx: mpsc::Sender<Arc<TransactionContext>>,
    armed_rx: Mutex<Option<mpsc::Receiver<Arc<TransactionContext>>>>,
}

impl TransactionScheduler {
    pub fn new(
        settings: &configuration::Scheduler,
        trading_day: String,
        store: Arc<dyn Queries>,
        trade: Arc<dyn TradeAdaptor>,
        risk: Arc<dyn RiskAssess>,
        trackers: Arc<TrackerTable>,
        callbacks: Arc<CallbackRegistry>,
    ) -> Self {
        let (armed_tx, armed_rx) = mpsc::channel(settings.armed_queue_capacity);
        Self {
            store,
            trade,
            risk,
            trackers,
            callbacks,
            trading_day,
            ack_timeout: Duration::from_secs(settings.ack_timeout_secs),
            ids: IdSource::new(),
            pending: Mutex::new(HashMap::new()),
            interrupts: Mutex::new(HashMap::new()),
            armed_tx,
            armed_rx: Mutex::new(Some(armed_rx)),
        }
    }

    /// The business date this scheduler stamps onto new entities.
    pub fn trading_day(&self) -> &str {
        &self.trading_day
    }

    /// Mints the id for a new transaction.
    pub fn next_transaction_id(&self) -> String {
        self.ids.next_transaction_id()
    }

    /// Seeds the id generator past ids already present in a restored ledger.
    pub fn seed_ids(&self, floor: u64) {
        self.ids.seed(floor);
    }

    /// The per-strategy interrupt flag, created on first use. While set,
    /// the strategy's pending transactions are not armed.
    pub async fn interrupt_flag(&self, strategy_id: &str) -> Arc<AtomicBool> {
        Arc::clone(
            self.interrupts
                .lock()
                .await
                .entry(strategy_id.to_string())
                .or_default(),
        )
    }

    /// Persists a new transaction and adds it to the pending set. Pushing an
    /// id that is already pending returns the existing context (idempotent
    /// enqueue). Persistence failure here rethrows: a transaction that was
    /// never durably recorded must not run.
    pub async fn push(&self, record: Transaction) -> Result<Arc<TransactionContext>, EngineError> {
        let mut pending = self.pending.lock().await;
        if let Some(existing) = pending.get(&record.id) {
            return Ok(Arc::clone(existing));
        }
        self.store.insert_transaction(record.clone()).await?;
        let ctx = TransactionContext::new(record);
        pending.insert(ctx.id.clone(), Arc::clone(&ctx));
        debug!(transaction = %ctx.id, "Transaction pushed as pending");
        Ok(ctx)
    }

    /// Arms every pending transaction on the tick's instrument: removes it
    /// from the pending set, stores the triggering tick, and offers it to
    /// the armed queue. When the queue is full the remaining candidates are
    /// skipped and a capacity fault is logged — backpressure, not an error.
    pub async fn awake(&self, tick: &Tick) {
        let mut pending = self.pending.lock().await;
        let candidates: Vec<String> = {
            let interrupts = self.interrupts.lock().await;
            pending
                .values()
                .filter(|ctx| ctx.instrument_id == tick.instrument_id)
                .filter(|ctx| ctx.stage() == TransactionStage::Pending)
                .filter(|ctx| {
                    interrupts
                        .get(&ctx.strategy_id)
                        .map(|flag| !flag.load(Ordering::SeqCst))
                        .unwrap_or(true)
                })
                .map(|ctx| ctx.id.clone())
                .collect()
        };

        for id in candidates {
            let Some(ctx) = pending.get(&id).cloned() else {
                continue;
            };
            ctx.advance_stage(TransactionStage::Queueing);
            ctx.set_triggering_tick(tick.clone()).await;
            match self.armed_tx.try_send(Arc::clone(&ctx)) {
                Ok(()) => {
                    pending.remove(&id);
                    ctx.set_state(
                        self.store.as_ref(),
                        "queueing".to_string(),
                        format!("armed by tick at {}", tick.last_price),
                    )
                    .await;
                }
                Err(_) => {
                    // Leave this and all remaining candidates pending; the
                    // next qualifying tick re-arms them.
                    ctx.advance_stage(TransactionStage::Pending);
                    warn!(
                        code = codes::QUEUE_CAPACITY,
                        instrument = %tick.instrument_id,
                        "Armed queue full; remaining candidates skipped"
                    );
                    break;
                }
            }
        }
    }

    /// The worker loop: drains the armed queue sequentially, giving strict
    /// FIFO processing across transactions. Must be spawned exactly once.
    pub async fn run_worker(self: Arc<Self>) {
        let receiver = self.armed_rx.lock().await.take();
        let Some(mut receiver) = receiver else {
            error!("Scheduler worker started twice; refusing to run");
            return;
        };
        info!("Transaction scheduler worker running");
        while let Some(ctx) = receiver.recv().await {
            self.process(ctx).await;
        }
        debug!("Armed queue closed; scheduler worker exiting");
    }

    /// Processes one armed transaction end to end.
    async fn process(&self, ctx: Arc<TransactionContext>) {
        let record = ctx.snapshot().await;
        let Some(tick) = ctx.triggering_tick().await else {
            // Cannot happen through awake; guard against misuse.
            self.abort(&ctx, "queueing", codes::RISK_FAULT, "armed without a tick")
                .await;
            return;
        };

        // Risk assessment runs first; a defective risk engine is reported
        // (code 1005) and processing continues as if accepted.
        match self.risk.before(&tick, &record) {
            Ok(verdict) if !verdict.is_good() => {
                self.abort(&ctx, "check-risk", verdict.code, &verdict.message)
                    .await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(transaction = %ctx.id, error = %e, "Risk engine failed in before hook");
                self.callbacks
                    .push_notice(
                        &ctx.strategy_id,
                        Notice::for_transaction(
                            codes::RISK_FAULT,
                            format!("risk engine fault: {e}"),
                            ctx.id.clone(),
                            None,
                        ),
                    )
                    .await;
            }
        }

        if ctx.has_parked_orders().await {
            self.resend_parked(&ctx).await;
            return;
        }

        match record.offset {
            Offset::Open => self.check_open(&ctx, &record).await,
            Offset::Close => self.check_close(&ctx, &record).await,
        }
    }

    /// Resubmits orders parked after a market-closed reject, without
    /// creating new orders or re-locking contracts.
    async fn resend_parked(&self, ctx: &Arc<TransactionContext>) {
        let parked = ctx.take_parked_orders().await;
        for _ in &parked {
            ctx.order_sent();
        }
        let mut parked_again = false;
        for pending_order in parked {
            let outcome = self
                .submit(ctx, pending_order.order, pending_order.contract_ids)
                .await;
            parked_again |= outcome == SubmitOutcome::Parked;
        }
        if parked_again {
            self.requeue_pending(ctx).await;
        }
    }

    /// The open path: balance check, margin/commission computation, contract
    /// materialization, one order.
    async fn check_open(&self, ctx: &Arc<TransactionContext>, record: &Transaction) {
        let user_id = match self.user_for_strategy(&ctx.strategy_id).await {
            Some(user_id) => user_id,
            None => {
                self.abort(
                    ctx,
                    "check-open",
                    codes::NO_INSTRUMENT,
                    "no profile registered for strategy",
                )
                .await;
                return;
            }
        };

        let account = match self.account_of(&user_id).await {
            Some(account) => account,
            None => {
                self.abort(ctx, "check-open", codes::NO_AVAILABLE_FUNDS, "no account")
                    .await;
                return;
            }
        };
        if account.available <= Decimal::ZERO {
            self.abort(
                ctx,
                "check-open",
                codes::NO_AVAILABLE_FUNDS,
                "no available funds",
            )
            .await;
            return;
        }

        let instrument = match self.instrument_of(&record.instrument_id).await {
            Some(instrument) => instrument,
            None => {
                self.abort(
                    ctx,
                    "check-open",
                    codes::NO_INSTRUMENT,
                    format!("no instrument info for {}", record.instrument_id),
                )
                .await;
                return;
            }
        };

        let volume = Decimal::from(record.volume);
        let margin = instrument.margin_per_lot(record.price) * volume;
        let commission = instrument.commission_per_lot(record.price) * volume;
        if margin + commission > account.available {
            self.abort(
                ctx,
                "check-open",
                codes::INSUFFICIENT_FUNDS,
                format!(
                    "need {} (margin {margin} + commission {commission}), available {}",
                    margin + commission,
                    account.available
                ),
            )
            .await;
            return;
        }

        // Commit the funds now: later opens on the same account must see the
        // reduced available balance. Settlement zeroes these accumulators and
        // recomputes the derived fields from the surviving contracts.
        let mut committed = account;
        committed.opening_margin += margin;
        committed.opening_commission += commission;
        committed.available -= margin + commission;
        if let Err(e) = self.store.update_account(committed).await {
            warn!(user = %user_id, error = %e, "Failed to persist opening commitment");
        }

        let order_id = IdSource::order_id(&ctx.id, 0);
        let mut contract_ids = Vec::with_capacity(record.volume as usize);
        for ordinal in 0..record.volume {
            let contract = Contract {
                id: IdSource::contract_id(&order_id, ordinal),
                user_id: user_id.clone(),
                instrument_id: record.instrument_id.clone(),
                direction: record.direction,
                price: record.price,
                state: ContractState::Opening,
                open_trading_day: self.trading_day.clone(),
                open_time: Utc::now(),
                close_price: None,
            };
            contract_ids.push(contract.id.clone());
            if let Err(e) = self.store.insert_contract(contract).await {
                warn!(order = %order_id, error = %e, "Failed to persist opening contract");
            }
        }

        let order = self.make_order(ctx, record, &order_id, record.volume, OrderOffset::Open);
        ctx.order_sent();
        if self.submit(ctx, order, contract_ids).await == SubmitOutcome::Parked {
            self.requeue_pending(ctx).await;
        }
    }

    /// The close path: FIFO lot selection, contract locking, and up to two
    /// orders (today lots and history lots), submitted independently.
    async fn check_close(&self, ctx: &Arc<TransactionContext>, record: &Transaction) {
        let Some(user_id) = self.user_for_strategy(&ctx.strategy_id).await else {
            self.abort(
                ctx,
                "check-close",
                codes::NO_INSTRUMENT,
                "no profile registered for strategy",
            )
            .await;
            return;
        };

        let mut candidates: Vec<Contract> = match self.store.select_contracts().await {
            Ok(contracts) => contracts
                .into_iter()
                .filter(|c| c.user_id == user_id)
                .filter(|c| c.instrument_id == record.instrument_id)
                .filter(|c| c.direction == record.direction.opposite())
                .filter(|c| c.state == ContractState::Open)
                .collect(),
            Err(e) => {
                warn!(transaction = %ctx.id, error = %e, "Cannot load contracts for close");
                Vec::new()
            }
        };
        // FIFO lot selection: oldest open time first, id as the tie-break.
        candidates.sort_by(|a, b| a.open_time.cmp(&b.open_time).then(a.id.cmp(&b.id)));

        if (candidates.len() as u32) < record.volume {
            self.abort(
                ctx,
                "check-close",
                codes::INSUFFICIENT_POSITION,
                format!(
                    "close needs {} lots, {} open",
                    record.volume,
                    candidates.len()
                ),
            )
            .await;
            return;
        }
        candidates.truncate(record.volume as usize);

        let Some(instrument) = self.instrument_of(&record.instrument_id).await else {
            self.abort(
                ctx,
                "check-close",
                codes::NO_INSTRUMENT,
                format!("no instrument info for {}", record.instrument_id),
            )
            .await;
            return;
        };

        // Closing frees no margin before settlement, but its commission is
        // committed up front like an open's.
        let commission =
            instrument.commission_per_lot(record.price) * Decimal::from(record.volume);
        if let Some(mut account) = self.account_of(&user_id).await {
            account.closing_commission += commission;
            account.available -= commission;
            if let Err(e) = self.store.update_account(account).await {
                warn!(user = %user_id, error = %e, "Failed to persist closing commitment");
            }
        }

        let mut today = Vec::new();
        let mut history = Vec::new();
        for mut contract in candidates {
            contract.state = ContractState::Closing;
            if let Err(e) = self.store.update_contract(contract.clone()).await {
                warn!(contract = %contract.id, error = %e, "Failed to persist closing lock");
            }
            if contract.open_trading_day == self.trading_day {
                today.push(contract.id);
            } else {
                history.push(contract.id);
            }
        }

        // No atomic multi-order submission: a failure on either order still
        // submits the other.
        let mut planned = Vec::new();
        let mut ordinal = 0;
        for (offset, contract_ids) in [
            (OrderOffset::CloseToday, today),
            (OrderOffset::CloseHistory, history),
        ] {
            if contract_ids.is_empty() {
                continue;
            }
            let order_id = IdSource::order_id(&ctx.id, ordinal);
            ordinal += 1;
            let order = self.make_order(ctx, record, &order_id, contract_ids.len() as u32, offset);
            planned.push((order, contract_ids));
        }

        // Raise the live-order counter for the whole plan before the first
        // submit, so an early fill on the first order cannot complete the
        // transaction while the second is still unsent.
        for _ in &planned {
            ctx.order_sent();
        }
        let mut parked = false;
        for (order, contract_ids) in planned {
            parked |= self.submit(ctx, order, contract_ids).await == SubmitOutcome::Parked;
        }
        if parked {
            self.requeue_pending(ctx).await;
        }
    }

    fn make_order(
        &self,
        ctx: &TransactionContext,
        record: &Transaction,
        order_id: &str,
        volume: u32,
        offset: OrderOffset,
    ) -> Order {
        Order {
            id: order_id.to_string(),
            transaction_id: ctx.id.clone(),
            instrument_id: record.instrument_id.clone(),
            price: record.price,
            volume,
            direction: record.direction,
            offset,
            state: "created".to_string(),
            trading_day: self.trading_day.clone(),
        }
    }

    /// Registers a tracker, hands the order to the broker, and blocks for the
    /// first acknowledgement.
    async fn submit(
        &self,
        ctx: &Arc<TransactionContext>,
        mut order: Order,
        contract_ids: Vec<String>,
    ) -> SubmitOutcome {
        let tracker = Arc::new(OrderExecutionTracker::new(
            order.clone(),
            contract_ids.clone(),
            Arc::clone(ctx),
            Arc::clone(&self.store),
            Arc::clone(&self.risk),
            Arc::clone(&self.callbacks),
        ));
        if let Err(e) = self.trackers.register(&order.id, tracker.clone()).await {
            // Duplicate order id: programming/adapter fault. Reported loudly
            // and the transaction surfaced for manual inspection.
            error!(order = %order.id, error = %e, "Duplicate order registration");
            self.risk
                .notice(codes::DUPLICATED_ORDER, &format!("duplicate order {}", order.id));
            self.abort(
                ctx,
                "send",
                codes::DUPLICATED_ORDER,
                format!("duplicate order id {}", order.id),
            )
            .await;
            return SubmitOutcome::Aborted;
        }

        if let Err(e) = self.store.insert_order(order.clone()).await {
            // The order may already exist from a prior parked submit.
            debug!(order = %order.id, error = %e, "Order not inserted (may already exist)");
        }

        // The caller raised the live-order counter for every planned order
        // before the first submit; a parked or failed submit compensates it
        // here.
        if let Err(e) = self.trade.require(&order).await {
            self.trackers.remove(&order.id).await;
            ctx.order_abandoned();
            self.release_contracts(&order, &contract_ids).await;
            self.abort(
                ctx,
                "send",
                codes::ACK_TIMEOUT,
                format!("order entry failed: {e}"),
            )
            .await;
            return SubmitOutcome::Aborted;
        }

        let (code, message) = tracker.wait_response(self.ack_timeout).await;
        match code {
            codes::OK => {
                // An early fill may already have completed the transaction;
                // never regress the record to send-running.
                let still_live = ctx
                    .set_state_if_active(
                        self.store.as_ref(),
                        "send-running".to_string(),
                        message,
                    )
                    .await;
                if still_live {
                    order.state = "send-running".to_string();
                    if let Err(e) = self.store.update_order(order.clone()).await {
                        warn!(order = %order.id, error = %e, "Failed to persist accepted order");
                    }
                    ctx.advance_stage(TransactionStage::SendRunning);
                }
                SubmitOutcome::Accepted
            }
            codes::MARKET_CLOSED => {
                self.trackers.remove(&order.id).await;
                ctx.order_abandoned();
                ctx.park_order(PendingOrder {
                    order,
                    contract_ids,
                })
                .await;
                debug!(transaction = %ctx.id, "Market closed; order parked for resend");
                SubmitOutcome::Parked
            }
            _ => {
                self.trackers.remove(&order.id).await;
                ctx.order_abandoned();
                self.release_contracts(&order, &contract_ids).await;
                self.abort(ctx, "send", code, message).await;
                SubmitOutcome::Aborted
            }
        }
    }

    /// Releases contracts locked by an order that will never execute and
    /// reverses the funds committed for them: opening lots are discarded and
    /// their margin/commission refunded, closing lots revert to open and
    /// their commission refunded.
    async fn release_contracts(&self, order: &Order, contract_ids: &[String]) {
        let contracts = match self.store.select_contracts().await {
            Ok(contracts) => contracts,
            Err(e) => {
                warn!(error = %e, "Cannot load contracts to release order locks");
                return;
            }
        };
        let instrument = self.instrument_of(&order.instrument_id).await;

        let mut user_id = None;
        let mut margin_refund = Decimal::ZERO;
        let mut commission_refund = Decimal::ZERO;
        for contract in contracts {
            if !contract_ids.contains(&contract.id) {
                continue;
            }
            user_id.get_or_insert(contract.user_id.clone());
            if order.offset.is_close() {
                if contract.state != ContractState::Closing {
                    continue;
                }
                if let Some(instrument) = &instrument {
                    commission_refund += instrument.commission_per_lot(order.price);
                }
                let mut reverted = contract;
                reverted.state = ContractState::Open;
                if let Err(e) = self.store.update_contract(reverted).await {
                    warn!(error = %e, "Failed to revert closing contract");
                }
            } else {
                if let Some(instrument) = &instrument {
                    margin_refund += instrument.margin_per_lot(contract.price);
                    commission_refund += instrument.commission_per_lot(contract.price);
                }
                if let Err(e) = self.store.remove_contract(&contract.id).await {
                    warn!(contract = %contract.id, error = %e, "Failed to discard opening contract");
                }
            }
        }

        let Some(user_id) = user_id else { return };
        if margin_refund.is_zero() && commission_refund.is_zero() {
            return;
        }
        if let Some(mut account) = self.account_of(&user_id).await {
            if order.offset.is_close() {
                account.closing_commission -= commission_refund;
            } else {
                account.opening_margin -= margin_refund;
                account.opening_commission -= commission_refund;
            }
            account.available += margin_refund + commission_refund;
            if let Err(e) = self.store.update_account(account).await {
                warn!(user = %user_id, error = %e, "Failed to refund released commitment");
            }
        }
    }

    /// Puts a transaction with parked orders back into the pending set so
    /// the next qualifying tick re-arms it.
    async fn requeue_pending(&self, ctx: &Arc<TransactionContext>) {
        ctx.advance_stage(TransactionStage::Pending);
        ctx.set_state(
            self.store.as_ref(),
            codes::state_tag("pending", codes::MARKET_CLOSED),
            "market closed; awaiting re-arm".to_string(),
        )
        .await;
        self.pending
            .lock()
            .await
            .insert(ctx.id.clone(), Arc::clone(ctx));
    }

    /// Terminal failure: persists the coded state tag, unblocks joiners, and
    /// notifies the strategy.
    async fn abort(
        &self,
        ctx: &Arc<TransactionContext>,
        phase: &str,
        code: i32,
        message: impl Into<String>,
    ) {
        let message = message.into();
        warn!(transaction = %ctx.id, code, %message, "Transaction aborted");
        ctx.set_state(
            self.store.as_ref(),
            codes::state_tag(phase, code),
            message.clone(),
        )
        .await;
        ctx.set_stage(TransactionStage::Aborted(code));
        self.callbacks
            .push_notice(
                &ctx.strategy_id,
                Notice::for_transaction(code, message, ctx.id.clone(), None),
            )
            .await;
    }

    async fn user_for_strategy(&self, strategy_id: &str) -> Option<String> {
        match self.store.select_strategy_profiles().await {
            Ok(profiles) => profiles
                .into_iter()
                .find(|p| p.strategy_id == strategy_id)
                .map(|p| p.user_id),
            Err(e) => {
                warn!(error = %e, "Cannot load strategy profiles");
                None
            }
        }
    }

    async fn account_of(&self, user_id: &str) -> Option<core_types::Account> {
        match self.store.select_accounts().await {
            Ok(accounts) => accounts.into_iter().find(|a| a.user_id == user_id),
            Err(e) => {
                warn!(error = %e, "Cannot load accounts");
                None
            }
        }
    }

    async fn instrument_of(&self, instrument_id: &str) -> Option<core_types::Instrument> {
        match self.store.select_instruments().await {
            Ok(instruments) => instruments
                .into_iter()
                .find(|i| i.instrument_id == instrument_id),
            Err(e) => {
                warn!(error = %e, "Cannot load instruments");
                None
            }
        }
    }

    /// Number of transactions currently awaiting a tick. Used by tests and
    /// by the engine's shutdown report.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Builds a transaction record in its initial pending state.
pub fn new_transaction(
    id: String,
    strategy_id: &str,
    instrument_id: &str,
    direction: Direction,
    offset: Offset,
    price: Decimal,
    volume: u32,
    trading_day: &str,
) -> Transaction {
    Transaction {
        id,
        strategy_id: strategy_id.to_string(),
        instrument_id: instrument_id.to_string(),
        direction,
        offset,
        price,
        volume,
        trading_day: trading_day.to_string(),
        state: "pending;never enqueued".to_string(),
        state_message: String::new(),
        update_time: Utc::now(),
    }
}
