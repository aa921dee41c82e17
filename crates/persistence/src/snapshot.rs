use crate::error::StoreError;
use crate::queries::Queries;
use async_trait::async_trait;
use core_types::{
    Account, Contract, Instrument, Order, StrategyProfile, Tick, Trade, Transaction, User,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;

/// The full ledger object graph. This is both the store's in-memory layout
/// and the JSON document written by `backup`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerGraph {
    pub users: HashMap<String, User>,
    pub accounts: HashMap<String, Account>,
    pub instruments: HashMap<String, Instrument>,
    pub contracts: HashMap<String, Contract>,
    pub transactions: HashMap<String, Transaction>,
    pub orders: HashMap<String, Order>,
    pub trades: HashMap<String, Trade>,
    /// Last tick per instrument.
    pub ticks: HashMap<String, Tick>,
    pub strategy_profiles: HashMap<String, StrategyProfile>,
}

/// An in-memory ledger store with whole-graph JSON snapshots.
///
/// All tables live behind a single async mutex; individual operations are
/// serialized, which is sufficient because allocation runs on the single
/// scheduler worker and settlement runs while trading is paused.
#[derive(Debug)]
pub struct SnapshotStore {
    graph: Mutex<LedgerGraph>,
}

impl SnapshotStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            graph: Mutex::new(LedgerGraph::default()),
        }
    }

    /// Creates a store from a previously captured graph.
    pub fn from_graph(graph: LedgerGraph) -> Self {
        Self {
            graph: Mutex::new(graph),
        }
    }

    /// Reads a snapshot file back into a graph.
    pub async fn restore(file: &Path) -> Result<LedgerGraph, StoreError> {
        let bytes = tokio::fs::read(file).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_unique<T>(
    table: &mut HashMap<String, T>,
    table_name: &str,
    id: String,
    value: T,
) -> Result<(), StoreError> {
    if table.contains_key(&id) {
        return Err(StoreError::Duplicate(id, table_name.to_string()));
    }
    table.insert(id, value);
    Ok(())
}

fn update_existing<T>(
    table: &mut HashMap<String, T>,
    table_name: &str,
    id: String,
    value: T,
) -> Result<(), StoreError> {
    if !table.contains_key(&id) {
        return Err(StoreError::NotFound(id, table_name.to_string()));
    }
    table.insert(id, value);
    Ok(())
}

#[async_trait]
impl Queries for SnapshotStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn select_users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.graph.lock().await.users.values().cloned().collect())
    }

    async fn select_accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(self.graph.lock().await.accounts.values().cloned().collect())
    }

    async fn select_instruments(&self) -> Result<Vec<Instrument>, StoreError> {
        Ok(self.graph.lock().await.instruments.values().cloned().collect())
    }

    async fn select_contracts(&self) -> Result<Vec<Contract>, StoreError> {
        Ok(self.graph.lock().await.contracts.values().cloned().collect())
    }

    async fn select_transactions(&self) -> Result<Vec<Transaction>, StoreError> {
        Ok(self.graph.lock().await.transactions.values().cloned().collect())
    }

    async fn select_orders(&self) -> Result<Vec<Order>, StoreError> {
        Ok(self.graph.lock().await.orders.values().cloned().collect())
    }

    async fn select_trades(&self) -> Result<Vec<Trade>, StoreError> {
        Ok(self.graph.lock().await.trades.values().cloned().collect())
    }

    async fn select_ticks(&self) -> Result<Vec<Tick>, StoreError> {
        Ok(self.graph.lock().await.ticks.values().cloned().collect())
    }

    async fn select_strategy_profiles(&self) -> Result<Vec<StrategyProfile>, StoreError> {
        Ok(self
            .graph
            .lock()
            .await
            .strategy_profiles
            .values()
            .cloned()
            .collect())
    }

    async fn insert_user(&self, user: User) -> Result<(), StoreError> {
        let mut graph = self.graph.lock().await;
        insert_unique(&mut graph.users, "users", user.user_id.clone(), user)
    }

    async fn insert_account(&self, account: Account) -> Result<(), StoreError> {
        let mut graph = self.graph.lock().await;
        insert_unique(
            &mut graph.accounts,
            "accounts",
            account.user_id.clone(),
            account,
        )
    }

    async fn insert_instrument(&self, instrument: Instrument) -> Result<(), StoreError> {
        let mut graph = self.graph.lock().await;
        insert_unique(
            &mut graph.instruments,
            "instruments",
            instrument.instrument_id.clone(),
            instrument,
        )
    }

    async fn insert_contract(&self, contract: Contract) -> Result<(), StoreError> {
        let mut graph = self.graph.lock().await;
        insert_unique(
            &mut graph.contracts,
            "contracts",
            contract.id.clone(),
            contract,
        )
    }

    async fn insert_transaction(&self, transaction: Transaction) -> Result<(), StoreError> {
        let mut graph = self.graph.lock().await;
        insert_unique(
            &mut graph.transactions,
            "transactions",
            transaction.id.clone(),
            transaction,
        )
    }

    async fn insert_order(&self, order: Order) -> Result<(), StoreError> {
        let mut graph = self.graph.lock().await;
        insert_unique(&mut graph.orders, "orders", order.id.clone(), order)
    }

    async fn insert_trade(&self, trade: Trade) -> Result<(), StoreError> {
        let mut graph = self.graph.lock().await;
        insert_unique(&mut graph.trades, "trades", trade.id.clone(), trade)
    }

    async fn insert_strategy_profile(&self, profile: StrategyProfile) -> Result<(), StoreError> {
        let mut graph = self.graph.lock().await;
        insert_unique(
            &mut graph.strategy_profiles,
            "strategy_profiles",
            profile.strategy_id.clone(),
            profile,
        )
    }

    async fn update_account(&self, account: Account) -> Result<(), StoreError> {
        let mut graph = self.graph.lock().await;
        update_existing(
            &mut graph.accounts,
            "accounts",
            account.user_id.clone(),
            account,
        )
    }

    async fn update_contract(&self, contract: Contract) -> Result<(), StoreError> {
        let mut graph = self.graph.lock().await;
        update_existing(
            &mut graph.contracts,
            "contracts",
            contract.id.clone(),
            contract,
        )
    }

    async fn update_transaction(&self, transaction: Transaction) -> Result<(), StoreError> {
        let mut graph = self.graph.lock().await;
        update_existing(
            &mut graph.transactions,
            "transactions",
            transaction.id.clone(),
            transaction,
        )
    }

    async fn update_order(&self, order: Order) -> Result<(), StoreError> {
        let mut graph = self.graph.lock().await;
        update_existing(&mut graph.orders, "orders", order.id.clone(), order)
    }

    async fn update_strategy_profile(&self, profile: StrategyProfile) -> Result<(), StoreError> {
        let mut graph = self.graph.lock().await;
        update_existing(
            &mut graph.strategy_profiles,
            "strategy_profiles",
            profile.strategy_id.clone(),
            profile,
        )
    }

    async fn update_tick(&self, tick: Tick) -> Result<(), StoreError> {
        // Ticks are an upsert: only the last value per instrument is retained.
        let mut graph = self.graph.lock().await;
        graph.ticks.insert(tick.instrument_id.clone(), tick);
        Ok(())
    }

    async fn remove_contract(&self, contract_id: &str) -> Result<(), StoreError> {
        let mut graph = self.graph.lock().await;
        graph
            .contracts
            .remove(contract_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(contract_id.to_string(), "contracts".to_string()))
    }

    async fn remove_strategy_profile(&self, strategy_id: &str) -> Result<(), StoreError> {
        let mut graph = self.graph.lock().await;
        graph
            .strategy_profiles
            .remove(strategy_id)
            .map(|_| ())
            .ok_or_else(|| {
                StoreError::NotFound(strategy_id.to_string(), "strategy_profiles".to_string())
            })
    }

    async fn clear_ticks(&self) -> Result<(), StoreError> {
        self.graph.lock().await.ticks.clear();
        Ok(())
    }

    async fn clear_trades(&self) -> Result<(), StoreError> {
        self.graph.lock().await.trades.clear();
        Ok(())
    }

    async fn clear_orders(&self) -> Result<(), StoreError> {
        self.graph.lock().await.orders.clear();
        Ok(())
    }

    async fn clear_transactions(&self) -> Result<(), StoreError> {
        self.graph.lock().await.transactions.clear();
        Ok(())
    }

    async fn backup(&self, file: &Path) -> Result<(), StoreError> {
        let bytes = {
            let graph = self.graph.lock().await;
            serde_json::to_vec_pretty(&*graph)?
        };
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(file, bytes).await?;
        debug!("Wrote ledger snapshot to {}", file.display());
        Ok(())
    }
}
