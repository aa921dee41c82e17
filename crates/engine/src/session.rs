use crate::context::TransactionContext;
use crate::error::EngineError;
use crate::scheduler::{new_transaction, TransactionScheduler};
use core_types::{
    Account, Contract, ContractState, Direction, Offset, Order, Trade, Transaction,
};
use persistence::Queries;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// A net position derived from the contract ledger: open lots aggregated by
/// instrument and direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub instrument_id: String,
    pub direction: Direction,
    pub volume: u32,
}

/// A strategy's handle onto the engine: trading entry points plus read-only
/// views of its own slice of the ledger.
///
/// `open`/`close` validate eagerly and return the transaction context; the
/// caller may `join` it or fire and forget. Requests rejected at validation
/// never create a transaction.
pub struct StrategySession {
    strategy_id: String,
    user_id: String,
    trading_day: String,
    scheduler: Arc<TransactionScheduler>,
    store: Arc<dyn Queries>,
    interrupted: Arc<AtomicBool>,
}

impl StrategySession {
    pub(crate) fn new(
        strategy_id: String,
        user_id: String,
        trading_day: String,
        scheduler: Arc<TransactionScheduler>,
        store: Arc<dyn Queries>,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            strategy_id,
            user_id,
            trading_day,
            scheduler,
            store,
            interrupted,
        }
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Requests opening `volume` new contracts at `price`.
    pub async fn open(
        &self,
        instrument_id: &str,
        direction: Direction,
        price: Decimal,
        volume: u32,
    ) -> Result<Arc<TransactionContext>, EngineError> {
        self.request(instrument_id, direction, Offset::Open, price, volume)
            .await
    }

    /// Requests closing `volume` contracts held against `direction`'s
    /// opposite.
    pub async fn close(
        &self,
        instrument_id: &str,
        direction: Direction,
        price: Decimal,
        volume: u32,
    ) -> Result<Arc<TransactionContext>, EngineError> {
        self.request(instrument_id, direction, Offset::Close, price, volume)
            .await
    }

    async fn request(
        &self,
        instrument_id: &str,
        direction: Direction,
        offset: Offset,
        price: Decimal,
        volume: u32,
    ) -> Result<Arc<TransactionContext>, EngineError> {
        if instrument_id.is_empty() {
            return Err(EngineError::Validation(
                "instrument id must not be empty".to_string(),
            ));
        }
        if price <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "price must be positive, got {price}"
            )));
        }
        if volume == 0 {
            return Err(EngineError::Validation("volume must be positive".to_string()));
        }

        let record = new_transaction(
            self.scheduler.next_transaction_id(),
            &self.strategy_id,
            instrument_id,
            direction,
            offset,
            price,
            volume,
            &self.trading_day,
        );
        self.scheduler.push(record).await
    }

    /// Suspends or resumes transaction arming for this strategy. Callbacks
    /// keep flowing; only new executions are held back.
    pub fn interrupt(&self, interrupted: bool) {
        info!(strategy = %self.strategy_id, interrupted, "Strategy interrupt flag changed");
        self.interrupted.store(interrupted, Ordering::SeqCst);
    }

    /// The strategy's trading account.
    pub async fn get_account(&self) -> Result<Account, EngineError> {
        self.store
            .select_accounts()
            .await?
            .into_iter()
            .find(|a| a.user_id == self.user_id)
            .ok_or_else(|| {
                EngineError::Unavailable(format!("no account for user {}", self.user_id))
            })
    }

    /// Open lots aggregated by instrument and direction.
    pub async fn get_positions(&self) -> Result<Vec<Position>, EngineError> {
        let mut grouped: HashMap<(String, Direction), u32> = HashMap::new();
        for contract in self.get_contracts().await? {
            if contract.state == ContractState::Open {
                *grouped
                    .entry((contract.instrument_id, contract.direction))
                    .or_default() += 1;
            }
        }
        let mut positions: Vec<Position> = grouped
            .into_iter()
            .map(|((instrument_id, direction), volume)| Position {
                instrument_id,
                direction,
                volume,
            })
            .collect();
        positions.sort_by(|a, b| a.instrument_id.cmp(&b.instrument_id));
        Ok(positions)
    }

    /// Every contract owned by the strategy's user, in any lifecycle state.
    pub async fn get_contracts(&self) -> Result<Vec<Contract>, EngineError> {
        Ok(self
            .store
            .select_contracts()
            .await?
            .into_iter()
            .filter(|c| c.user_id == self.user_id)
            .collect())
    }

    /// Every transaction this strategy has requested.
    pub async fn get_transactions(&self) -> Result<Vec<Transaction>, EngineError> {
        Ok(self
            .store
            .select_transactions()
            .await?
            .into_iter()
            .filter(|t| t.strategy_id == self.strategy_id)
            .collect())
    }

    /// Every order materialized from this strategy's transactions.
    pub async fn get_orders(&self) -> Result<Vec<Order>, EngineError> {
        let transaction_ids: Vec<String> = self
            .get_transactions()
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        Ok(self
            .store
            .select_orders()
            .await?
            .into_iter()
            .filter(|o| transaction_ids.contains(&o.transaction_id))
            .collect())
    }

    /// Every fill against this strategy's orders.
    pub async fn get_trades(&self) -> Result<Vec<Trade>, EngineError> {
        let order_ids: Vec<String> = self.get_orders().await?.into_iter().map(|o| o.id).collect();
        Ok(self
            .store
            .select_trades()
            .await?
            .into_iter()
            .filter(|t| order_ids.contains(&t.order_id))
            .collect())
    }
}
