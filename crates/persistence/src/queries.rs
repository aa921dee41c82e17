use crate::error::StoreError;
use async_trait::async_trait;
use core_types::{
    Account, Contract, Instrument, Order, StrategyProfile, Tick, Trade, Transaction, User,
};
use std::path::Path;

/// The persistence interface consumed by the execution core.
///
/// Every method may fail with a [`StoreError`]; callers log and continue at
/// almost every write site, except where a service-level operation explicitly
/// wraps and rethrows (pushing a new transaction, settlement).
#[async_trait]
pub trait Queries: Send + Sync {
    /// Prepares the store for use (creates the data directory, restores any
    /// prior snapshot the implementation supports).
    async fn initialize(&self) -> Result<(), StoreError>;

    // --- Reads: full-table selects, cloned out of the store. ---

    async fn select_users(&self) -> Result<Vec<User>, StoreError>;
    async fn select_accounts(&self) -> Result<Vec<Account>, StoreError>;
    async fn select_instruments(&self) -> Result<Vec<Instrument>, StoreError>;
    async fn select_contracts(&self) -> Result<Vec<Contract>, StoreError>;
    async fn select_transactions(&self) -> Result<Vec<Transaction>, StoreError>;
    async fn select_orders(&self) -> Result<Vec<Order>, StoreError>;
    async fn select_trades(&self) -> Result<Vec<Trade>, StoreError>;
    async fn select_ticks(&self) -> Result<Vec<Tick>, StoreError>;
    async fn select_strategy_profiles(&self) -> Result<Vec<StrategyProfile>, StoreError>;

    // --- Inserts: duplicate ids are rejected. ---

    async fn insert_user(&self, user: User) -> Result<(), StoreError>;
    async fn insert_account(&self, account: Account) -> Result<(), StoreError>;
    async fn insert_instrument(&self, instrument: Instrument) -> Result<(), StoreError>;
    async fn insert_contract(&self, contract: Contract) -> Result<(), StoreError>;
    async fn insert_transaction(&self, transaction: Transaction) -> Result<(), StoreError>;
    async fn insert_order(&self, order: Order) -> Result<(), StoreError>;
    async fn insert_trade(&self, trade: Trade) -> Result<(), StoreError>;
    async fn insert_strategy_profile(&self, profile: StrategyProfile) -> Result<(), StoreError>;

    // --- Updates: keyed by entity id; ticks upsert per instrument. ---

    async fn update_account(&self, account: Account) -> Result<(), StoreError>;
    async fn update_contract(&self, contract: Contract) -> Result<(), StoreError>;
    async fn update_transaction(&self, transaction: Transaction) -> Result<(), StoreError>;
    async fn update_order(&self, order: Order) -> Result<(), StoreError>;
    async fn update_strategy_profile(&self, profile: StrategyProfile) -> Result<(), StoreError>;
    async fn update_tick(&self, tick: Tick) -> Result<(), StoreError>;

    // --- Removals and transactional-table clears, used by settlement. ---

    async fn remove_contract(&self, contract_id: &str) -> Result<(), StoreError>;
    async fn remove_strategy_profile(&self, strategy_id: &str) -> Result<(), StoreError>;
    async fn clear_ticks(&self) -> Result<(), StoreError>;
    async fn clear_trades(&self) -> Result<(), StoreError>;
    async fn clear_orders(&self) -> Result<(), StoreError>;
    async fn clear_transactions(&self) -> Result<(), StoreError>;

    /// Writes the full object graph to the given file as a JSON document.
    async fn backup(&self, file: &Path) -> Result<(), StoreError>;
}
