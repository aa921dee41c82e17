//! # Meridian Engine Crate
//!
//! The execution core of the platform. It owns the transaction state
//! machine, the per-order execution trackers, the market-data router, and
//! the per-strategy callback queues, and wires them onto the broker and
//! market adaptors.
//!
//! ## Architectural Principles
//!
//! - **One logical writer per concern.** A single worker drains the armed
//!   transaction queue, a single worker drains the broker's event stream,
//!   and each strategy's callbacks run on a dedicated queue. Concurrency
//!   lives between the workers, never inside one.
//! - **Failures are coded, not thrown.** Business rejections travel as
//!   coded notices back to the strategy; only infrastructure faults surface
//!   as `Err`.
//! - **The ledger is the truth.** Every state change is pushed to the
//!   persistence layer as it happens so a crash loses at most the in-flight
//!   event.
//!
//! ## Public API
//!
//! [`Engine`] is the composition root: construct it with a store, the two
//! adaptors, and a risk engine, then `start` it and `add_strategy` to
//! obtain [`StrategySession`] handles.

use adapters::{MarketAdaptor, TradeAdaptor};
use chrono::Utc;
use configuration::settings::Config;
use core_types::{Account, StrategyProfile, User};
use persistence::Queries;
use risk::RiskAssess;
use rust_decimal::Decimal;
use std::sync::Arc;
use strategies::Strategy;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

// Declare the modules that constitute this crate.
pub mod callbacks;
pub mod context;
pub mod error;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod tracker;

// Re-export the key components to create a clean, public-facing API.
pub use callbacks::CallbackRegistry;
pub use context::{TransactionContext, TransactionStage};
pub use error::EngineError;
pub use router::MarketRouter;
pub use scheduler::TransactionScheduler;
pub use session::{Position, StrategySession};
pub use tracker::TrackerTable;

use std::time::Duration;

/// The composition root: builds the scheduler, tracker table, callback
/// registry, and router from one configuration, then runs their workers.
pub struct Engine {
    config: Config,
    store: Arc<dyn Queries>,
    trade: Arc<dyn TradeAdaptor>,
    market: Arc<dyn MarketAdaptor>,
    risk: Arc<dyn RiskAssess>,
    scheduler: Arc<TransactionScheduler>,
    router: Arc<MarketRouter>,
    callbacks: Arc<CallbackRegistry>,
    trackers: Arc<TrackerTable>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn new(
        config: Config,
        store: Arc<dyn Queries>,
        trade: Arc<dyn TradeAdaptor>,
        market: Arc<dyn MarketAdaptor>,
        risk: Arc<dyn RiskAssess>,
    ) -> Self {
        let trackers = Arc::new(TrackerTable::new());
        let callbacks = Arc::new(CallbackRegistry::new(
            Duration::from_secs(config.callbacks.data_budget_secs),
            Duration::from_secs(config.callbacks.lifecycle_budget_secs),
        ));
        let scheduler = Arc::new(TransactionScheduler::new(
            &config.scheduler,
            config.runtime.trading_day.clone(),
            Arc::clone(&store),
            Arc::clone(&trade),
            Arc::clone(&risk),
            Arc::clone(&trackers),
            Arc::clone(&callbacks),
        ));
        let router = Arc::new(MarketRouter::new(
            Arc::clone(&market),
            Arc::clone(&scheduler),
            Arc::clone(&callbacks),
            Arc::clone(&store),
            config.market.stale_tick_days,
        ));
        Self {
            config,
            store,
            trade,
            market,
            risk,
            scheduler,
            router,
            callbacks,
            trackers,
            workers: Vec::new(),
        }
    }

    /// Initializes the store, connects both adaptors, and spawns the three
    /// workers (scheduler, execution events, market feed).
    pub async fn start(&mut self) -> Result<(), EngineError> {
        self.store.initialize().await?;
        self.seed_transaction_ids().await?;

        self.trade.start().await?;
        self.market.start().await?;

        let events = self.trade.events()?;
        self.workers.push(tokio::spawn(tracker::run_execution_worker(
            Arc::clone(&self.trackers),
            events,
            Arc::clone(&self.store),
            Arc::clone(&self.risk),
            Arc::clone(&self.callbacks),
        )));

        self.workers
            .push(tokio::spawn(Arc::clone(&self.scheduler).run_worker()));

        let mut ticks = self.market.ticks()?;
        let router = Arc::clone(&self.router);
        self.workers.push(tokio::spawn(async move {
            while let Some(tick) = ticks.recv().await {
                router.on_tick(tick).await;
            }
        }));

        self.router.refresh_all_subscriptions().await?;
        info!(trading_day = %self.config.runtime.trading_day, "Engine started");
        Ok(())
    }

    /// Registers a strategy: bootstraps its user and account if missing,
    /// upserts its profile, starts its callback queue, and subscribes its
    /// instruments.
    pub async fn add_strategy(
        &self,
        user_id: &str,
        instrument_ids: &[String],
        strategy: Arc<Mutex<dyn Strategy>>,
    ) -> Result<StrategySession, EngineError> {
        let strategy_id = strategy.lock().await.strategy_id().to_string();

        self.bootstrap_user(user_id).await?;
        self.upsert_profile(&strategy_id, user_id, instrument_ids)
            .await?;

        self.callbacks.register(&strategy_id, strategy).await;
        self.router.subscribe(&strategy_id, instrument_ids).await?;

        let interrupted = self.scheduler.interrupt_flag(&strategy_id).await;
        info!(strategy = %strategy_id, user = %user_id, "Strategy registered");
        Ok(StrategySession::new(
            strategy_id,
            user_id.to_string(),
            self.config.runtime.trading_day.clone(),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.store),
            interrupted,
        ))
    }

    /// Marks the strategy's profile as removed (settlement drops it after
    /// the day closes), tears down its callback queue, and releases its
    /// subscriptions.
    pub async fn remove_strategy(&self, strategy_id: &str) -> Result<(), EngineError> {
        let mut profile = self
            .store
            .select_strategy_profiles()
            .await?
            .into_iter()
            .find(|p| p.strategy_id == strategy_id)
            .ok_or_else(|| EngineError::StrategyNotFound(strategy_id.to_string()))?;
        profile.state = "removed".to_string();
        self.store.update_strategy_profile(profile).await?;

        self.callbacks.destroy(strategy_id).await;
        self.router.unsubscribe(strategy_id).await;
        info!(strategy = %strategy_id, "Strategy removed");
        Ok(())
    }

    /// Stops every callback queue and disconnects both adaptors. Pending
    /// transactions stay in the ledger for the next run.
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        let pending = self.scheduler.pending_len().await;
        if pending > 0 {
            warn!(pending, "Shutting down with transactions still pending");
        }
        self.callbacks.destroy_all().await;
        self.trade.shutdown().await?;
        self.market.shutdown().await?;
        for worker in self.workers.drain(..) {
            worker.abort();
        }
        info!("Engine shut down");
        Ok(())
    }

    /// The router, exposed so embedding code can drive subscription changes
    /// or feed bars.
    pub fn router(&self) -> Arc<MarketRouter> {
        Arc::clone(&self.router)
    }

    async fn seed_transaction_ids(&self) -> Result<(), EngineError> {
        let floor = self
            .store
            .select_transactions()
            .await?
            .iter()
            .filter_map(|t| t.id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        self.scheduler.seed_ids(floor);
        Ok(())
    }

    async fn bootstrap_user(&self, user_id: &str) -> Result<(), EngineError> {
        let users = self.store.select_users().await?;
        if !users.iter().any(|u| u.user_id == user_id) {
            self.store
                .insert_user(User {
                    user_id: user_id.to_string(),
                    create_time: Utc::now(),
                })
                .await?;
        }
        let accounts = self.store.select_accounts().await?;
        if !accounts.iter().any(|a| a.user_id == user_id) {
            let initial = self.config.runtime.initial_balance;
            self.store
                .insert_account(Account {
                    user_id: user_id.to_string(),
                    balance: initial,
                    margin: Decimal::ZERO,
                    commission: Decimal::ZERO,
                    opening_margin: Decimal::ZERO,
                    opening_commission: Decimal::ZERO,
                    closing_commission: Decimal::ZERO,
                    available: initial,
                    position_profit: Decimal::ZERO,
                    close_profit: Decimal::ZERO,
                    yd_balance: initial,
                    trading_day: self.config.runtime.trading_day.clone(),
                })
                .await?;
            info!(user = %user_id, balance = %initial, "Account bootstrapped");
        }
        Ok(())
    }

    async fn upsert_profile(
        &self,
        strategy_id: &str,
        user_id: &str,
        instrument_ids: &[String],
    ) -> Result<(), EngineError> {
        let existing = self
            .store
            .select_strategy_profiles()
            .await?
            .into_iter()
            .find(|p| p.strategy_id == strategy_id);
        match existing {
            Some(mut profile) => {
                profile.user_id = user_id.to_string();
                profile.instrument_ids = instrument_ids.to_vec();
                profile.state = "normal".to_string();
                self.store.update_strategy_profile(profile).await?;
            }
            None => {
                self.store
                    .insert_strategy_profile(StrategyProfile {
                        strategy_id: strategy_id.to_string(),
                        user_id: user_id.to_string(),
                        instrument_ids: instrument_ids.to_vec(),
                        state: "normal".to_string(),
                        create_time: Utc::now(),
                    })
                    .await?;
            }
        }
        Ok(())
    }
}
