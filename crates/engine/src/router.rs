use crate::callbacks::CallbackRegistry;
use crate::error::EngineError;
use crate::scheduler::TransactionScheduler;
use adapters::MarketAdaptor;
use chrono::{Duration as ChronoDuration, Timelike, Utc};
use core_types::{Bar, Tick};
use persistence::Queries;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Fans incoming market data out to subscribed strategies and decides when a
/// tick may arm pending transactions.
///
/// Subscriptions are reference-counted per instrument: the adaptor is asked
/// for an instrument only when its first strategy subscribes, and every tick
/// reaches every subscriber.
pub struct MarketRouter {
    market: Arc<dyn MarketAdaptor>,
    scheduler: Arc<TransactionScheduler>,
    callbacks: Arc<CallbackRegistry>,
    store: Arc<dyn Queries>,
    stale_tick_days: i64,
    // instrument id -> subscribed strategy ids
    subscriptions: Mutex<HashMap<String, HashSet<String>>>,
}

impl MarketRouter {
    pub fn new(
        market: Arc<dyn MarketAdaptor>,
        scheduler: Arc<TransactionScheduler>,
        callbacks: Arc<CallbackRegistry>,
        store: Arc<dyn Queries>,
        stale_tick_days: i64,
    ) -> Self {
        Self {
            market,
            scheduler,
            callbacks,
            store,
            stale_tick_days,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes a strategy to a set of instruments, requesting each from
    /// the adaptor on its first subscriber.
    pub async fn subscribe(
        &self,
        strategy_id: &str,
        instrument_ids: &[String],
    ) -> Result<(), EngineError> {
        let mut subscriptions = self.subscriptions.lock().await;
        for instrument_id in instrument_ids {
            let subscribers = subscriptions
                .entry(instrument_id.clone())
                .or_default();
            let first = subscribers.is_empty();
            subscribers.insert(strategy_id.to_string());
            if first {
                self.market.add(instrument_id).await?;
                info!(instrument = %instrument_id, "Requested market data on first subscriber");
            }
        }
        Ok(())
    }

    /// Replaces a strategy's subscription set with `desired`: newly wanted
    /// instruments are added, no-longer-wanted ones are released.
    pub async fn update_subscription(
        &self,
        strategy_id: &str,
        desired: &[String],
    ) -> Result<(), EngineError> {
        let wanted: HashSet<&String> = desired.iter().collect();
        {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.retain(|instrument_id, subscribers| {
                if !wanted.contains(instrument_id) {
                    subscribers.remove(strategy_id);
                }
                !subscribers.is_empty()
            });
        }
        self.subscribe(strategy_id, desired).await
    }

    /// Removes a strategy from every instrument it subscribed to.
    pub async fn unsubscribe(&self, strategy_id: &str) {
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.retain(|_, subscribers| {
            subscribers.remove(strategy_id);
            !subscribers.is_empty()
        });
    }

    /// Re-requests every subscribed instrument from the adaptor, skipping
    /// those whose last recorded tick is older than the staleness threshold
    /// (the contract has most likely expired). Used after (re)connecting.
    pub async fn refresh_all_subscriptions(&self) -> Result<(), EngineError> {
        let last_ticks: HashMap<String, Tick> = self
            .store
            .select_ticks()
            .await?
            .into_iter()
            .map(|t| (t.instrument_id.clone(), t))
            .collect();
        let threshold = Utc::now() - ChronoDuration::days(self.stale_tick_days);

        let subscriptions = self.subscriptions.lock().await;
        for instrument_id in subscriptions.keys() {
            match last_ticks.get(instrument_id) {
                Some(tick) if tick.update_time < threshold => {
                    warn!(
                        instrument = %instrument_id,
                        last_tick = %tick.update_time,
                        "Last tick is stale; instrument treated as expired, not resubscribed"
                    );
                }
                // Never-seen instruments are requested; only proven-stale
                // ones are skipped.
                _ => self.market.add(instrument_id).await?,
            }
        }
        Ok(())
    }

    /// Routes one tick: fan-out to subscribers, recording as the
    /// instrument's last tick, and (outside the minute boundaries) arming of
    /// pending transactions.
    pub async fn on_tick(&self, tick: Tick) {
        let subscribers: Vec<String> = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions
                .get(&tick.instrument_id)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default()
        };
        for strategy_id in &subscribers {
            self.callbacks.push_tick(strategy_id, tick.clone()).await;
        }

        // Ticks at seconds 00 and 59 straddle the session boundary where the
        // broker flips between open and closed; arming on them produces
        // spurious market-closed rejects.
        let second = tick.update_time.second();
        if second != 0 && second != 59 {
            self.scheduler.awake(&tick).await;
        } else {
            debug!(instrument = %tick.instrument_id, second, "Arming suppressed at minute boundary");
        }

        if let Err(e) = self.store.update_tick(tick.clone()).await {
            warn!(instrument = %tick.instrument_id, error = %e, "Failed to record last tick");
        }
    }

    /// Routes one bar to every subscriber. Bars never arm transactions.
    pub async fn on_bar(&self, bar: Bar) {
        let subscribers: Vec<String> = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions
                .get(&bar.instrument_id)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default()
        };
        for strategy_id in &subscribers {
            self.callbacks.push_bar(strategy_id, bar.clone()).await;
        }
    }
}
