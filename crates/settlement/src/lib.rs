//! # Meridian Settlement Crate
//!
//! The end-of-day rollover. It runs while trading is paused: it snapshots
//! the ledger, rolls every user's contracts and account over the day
//! boundary, clears the transactional tables, and snapshots again.
//!
//! ## Architectural Principles
//!
//! - **All or nothing.** Unlike the intraday write sites, settlement rethrows
//!   every fault: a ledger it cannot fully settle is left as it was, with the
//!   pre-settlement backup on disk for inspection.
//! - **Pure math, impure pipeline.** The roll formulas live in
//!   [`facilities`] as pure functions over plain values; this file only
//!   moves data between them and the store.

use crate::facilities::{roll_account, roll_contracts};
use configuration::settings::Config;
use core_types::Contract;
use persistence::Queries;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

// Declare the modules that constitute this crate.
pub mod error;
pub mod facilities;

// Re-export the key components to create a clean, public-facing API.
pub use error::SettlementError;
pub use facilities::{profit, ContractRoll};

/// Orchestrates the end-of-day pipeline against one store.
pub struct SettlementEngine {
    store: Arc<dyn Queries>,
    data_dir: PathBuf,
    trading_day: String,
}

impl SettlementEngine {
    pub fn new(config: &Config, store: Arc<dyn Queries>) -> Self {
        Self {
            store,
            data_dir: PathBuf::from(&config.runtime.data_dir),
            trading_day: config.runtime.trading_day.clone(),
        }
    }

    /// Settles the configured trading day and advances every account onto
    /// `next_trading_day`.
    pub async fn settle(&self, next_trading_day: &str) -> Result<(), SettlementError> {
        let day_dir = self.data_dir.join(&self.trading_day);
        if let Err(e) = tokio::fs::create_dir_all(&day_dir).await {
            warn!(dir = %day_dir.display(), error = %e, "Cannot create snapshot directory");
        }
        self.store
            .backup(&day_dir.join("before_settlement.json"))
            .await?;

        let users = self.store.select_users().await?;
        let accounts = self.store.select_accounts().await?;
        let instruments: HashMap<String, core_types::Instrument> = self
            .store
            .select_instruments()
            .await?
            .into_iter()
            .map(|i| (i.instrument_id.clone(), i))
            .collect();
        let prices: HashMap<String, Decimal> = self
            .store
            .select_ticks()
            .await?
            .into_iter()
            .map(|t| (t.instrument_id, t.last_price))
            .collect();
        let contracts = self.store.select_contracts().await?;

        // Integrity gate: every account must belong to a user and every
        // contract to an account, before any mutation happens.
        for account in &accounts {
            if !users.iter().any(|u| u.user_id == account.user_id) {
                return Err(SettlementError::OrphanContract {
                    contract_id: "<account>".to_string(),
                    user_id: account.user_id.clone(),
                });
            }
        }
        let mut by_user: HashMap<String, Vec<Contract>> = HashMap::new();
        for contract in contracts {
            if !accounts.iter().any(|a| a.user_id == contract.user_id) {
                return Err(SettlementError::OrphanContract {
                    contract_id: contract.id,
                    user_id: contract.user_id,
                });
            }
            by_user.entry(contract.user_id.clone()).or_default().push(contract);
        }

        for account in &accounts {
            let owned = by_user.remove(&account.user_id).unwrap_or_default();
            let roll = roll_contracts(owned, &instruments, &prices, &self.trading_day)?;
            let settled = roll_account(account, &roll, next_trading_day);
            info!(
                user = %account.user_id,
                balance = %settled.balance,
                margin = %settled.margin,
                close_profit = %settled.close_profit,
                position_profit = %settled.position_profit,
                "Account settled"
            );
            self.store.update_account(settled).await?;
            for contract in roll.kept {
                self.store.update_contract(contract).await?;
            }
            for contract_id in roll.dropped {
                self.store.remove_contract(&contract_id).await?;
            }
        }

        self.drop_removed_profiles().await?;

        self.store.clear_ticks().await?;
        self.store.clear_trades().await?;
        self.store.clear_orders().await?;
        self.store.clear_transactions().await?;

        self.store.backup(&day_dir.join("settled.json")).await?;
        info!(trading_day = %self.trading_day, next = %next_trading_day, "Settlement finished");
        Ok(())
    }

    async fn drop_removed_profiles(&self) -> Result<(), SettlementError> {
        for profile in self.store.select_strategy_profiles().await? {
            if profile.state == "removed" {
                info!(strategy = %profile.strategy_id, "Dropping removed strategy profile");
                self.store
                    .remove_strategy_profile(&profile.strategy_id)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use core_types::{
        Account, ContractState, Direction, Instrument, StrategyProfile, Tick, User,
    };
    use persistence::SnapshotStore;
    use rust_decimal_macros::dec;

    fn config(data_dir: &str) -> Config {
        let mut config = Config::default();
        config.runtime.data_dir = data_dir.to_string();
        config.runtime.trading_day = "20260827".to_string();
        config
    }

    fn account() -> Account {
        Account {
            user_id: "u1".to_string(),
            balance: dec!(10000),
            margin: dec!(1000),
            commission: Decimal::ZERO,
            opening_margin: Decimal::ZERO,
            opening_commission: Decimal::ZERO,
            closing_commission: Decimal::ZERO,
            available: dec!(9000),
            position_profit: Decimal::ZERO,
            close_profit: Decimal::ZERO,
            yd_balance: dec!(10000),
            trading_day: "20260827".to_string(),
        }
    }

    fn instrument() -> Instrument {
        Instrument {
            instrument_id: "cu2409".to_string(),
            exchange_id: "SHFE".to_string(),
            multiple: dec!(5),
            amount_margin: Decimal::ZERO,
            volume_margin: dec!(1000),
            amount_commission: Decimal::ZERO,
            volume_commission: dec!(25),
            update_time: Utc::now(),
        }
    }

    fn open_contract(id: &str) -> Contract {
        Contract {
            id: id.to_string(),
            user_id: "u1".to_string(),
            instrument_id: "cu2409".to_string(),
            direction: Direction::Buy,
            price: dec!(1000),
            state: ContractState::Open,
            open_trading_day: "20260827".to_string(),
            open_time: Utc::now(),
            close_price: None,
        }
    }

    async fn seeded_store() -> Arc<SnapshotStore> {
        let store = Arc::new(SnapshotStore::new());
        store
            .insert_user(User {
                user_id: "u1".to_string(),
                create_time: Utc::now(),
            })
            .await
            .unwrap();
        store.insert_account(account()).await.unwrap();
        store.insert_instrument(instrument()).await.unwrap();
        store
            .update_tick(Tick {
                instrument_id: "cu2409".to_string(),
                last_price: dec!(1010),
                update_time: Utc::now(),
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn settles_one_open_contract_and_conserves_balance() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store().await;
        store.insert_contract(open_contract("1.0.0")).await.unwrap();

        let store_dyn: Arc<dyn Queries> = store.clone();
        let engine = SettlementEngine::new(&config(dir.path().to_str().unwrap()), store_dyn);
        engine.settle("20260828").await.unwrap();

        let settled = store.select_accounts().await.unwrap().remove(0);
        // balance = yd(10000) + position profit 50 - commission 25.
        assert_eq!(settled.balance, dec!(10025));
        assert_eq!(settled.yd_balance, dec!(10000));
        assert_eq!(settled.margin, dec!(1000));
        assert_eq!(
            settled.available,
            settled.balance - settled.margin - settled.commission
        );
        assert_eq!(settled.trading_day, "20260828");

        // The open lot survives; the transactional tables are cleared.
        assert_eq!(store.select_contracts().await.unwrap().len(), 1);
        assert!(store.select_ticks().await.unwrap().is_empty());
        assert!(store.select_transactions().await.unwrap().is_empty());

        assert!(dir.path().join("20260827/before_settlement.json").exists());
        assert!(dir.path().join("20260827/settled.json").exists());
    }

    #[tokio::test]
    async fn aborts_on_missing_settlement_price() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store().await;
        store.clear_ticks().await.unwrap();
        store.insert_contract(open_contract("1.0.0")).await.unwrap();

        let before = store.select_accounts().await.unwrap().remove(0);
        let store_dyn: Arc<dyn Queries> = store.clone();
        let engine = SettlementEngine::new(&config(dir.path().to_str().unwrap()), store_dyn);
        let err = engine.settle("20260828").await.unwrap_err();
        assert!(matches!(err, SettlementError::MissingPrice(_)));

        // The account was not touched.
        let after = store.select_accounts().await.unwrap().remove(0);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn aborts_on_orphan_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store().await;
        let mut orphan = open_contract("9.0.0");
        orphan.user_id = "nobody".to_string();
        store.insert_contract(orphan).await.unwrap();

        let store_dyn: Arc<dyn Queries> = store.clone();
        let engine = SettlementEngine::new(&config(dir.path().to_str().unwrap()), store_dyn);
        assert!(matches!(
            engine.settle("20260828").await.unwrap_err(),
            SettlementError::OrphanContract { .. }
        ));
    }

    #[tokio::test]
    async fn removed_profiles_are_dropped_at_settlement() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store().await;
        for (id, state) in [("s1", "normal"), ("s2", "removed")] {
            store
                .insert_strategy_profile(StrategyProfile {
                    strategy_id: id.to_string(),
                    user_id: "u1".to_string(),
                    instrument_ids: vec!["cu2409".to_string()],
                    state: state.to_string(),
                    create_time: Utc::now(),
                })
                .await
                .unwrap();
        }

        let store_dyn: Arc<dyn Queries> = store.clone();
        let engine = SettlementEngine::new(&config(dir.path().to_str().unwrap()), store_dyn);
        engine.settle("20260828").await.unwrap();

        let profiles = store.select_strategy_profiles().await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].strategy_id, "s1");
    }
}
