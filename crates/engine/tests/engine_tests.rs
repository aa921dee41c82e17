use adapters::{MarketAdaptor, SimMarketAdaptor, SimTradeAdaptor, TradeAdaptor};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use configuration::settings::{Callbacks, Config, Market, Runtime, Scheduler};
use core_types::{
    ContractState, Direction, Instrument, Notice, Tick, Trade,
};
use engine::{Engine, TransactionStage};
use persistence::{Queries, SnapshotStore};
use risk::PermissiveRisk;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use strategies::Strategy;
use tokio::sync::Mutex;

/// Captures every notice the engine delivers, for assertions.
struct RecordingStrategy {
    id: String,
    notices: Arc<StdMutex<Vec<Notice>>>,
    trades: Arc<StdMutex<Vec<Trade>>>,
}

#[async_trait]
impl Strategy for RecordingStrategy {
    fn strategy_id(&self) -> &str {
        &self.id
    }

    async fn on_trade(&mut self, trade: &Trade) -> Result<(), strategies::StrategyError> {
        self.trades.lock().unwrap().push(trade.clone());
        Ok(())
    }

    async fn on_notice(&mut self, notice: &Notice) -> Result<(), strategies::StrategyError> {
        self.notices.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

struct Harness {
    engine: Engine,
    store: Arc<SnapshotStore>,
    trade: Arc<SimTradeAdaptor>,
    market: Arc<SimMarketAdaptor>,
    notices: Arc<StdMutex<Vec<Notice>>>,
    trades: Arc<StdMutex<Vec<Trade>>>,
}

fn config(initial_balance: Decimal) -> Config {
    Config {
        runtime: Runtime {
            data_dir: "unused".to_string(),
            trading_day: "20260827".to_string(),
            initial_balance,
        },
        scheduler: Scheduler {
            armed_queue_capacity: 16,
            ack_timeout_secs: 1,
        },
        callbacks: Callbacks {
            data_budget_secs: 1,
            lifecycle_budget_secs: 1,
        },
        market: Market { stale_tick_days: 30 },
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

fn tick() -> Tick {
    Tick {
        instrument_id: "cu2409".to_string(),
        last_price: dec!(1000),
        update_time: Utc
            .with_ymd_and_hms(2026, 8, 27, 10, 30, 30)
            .single()
            .unwrap(),
    }
}

async fn start_harness(initial_balance: Decimal) -> (Harness, engine::StrategySession) {
    let store = Arc::new(SnapshotStore::new());
    store.insert_instrument(instrument()).await.unwrap();

    let trade = Arc::new(SimTradeAdaptor::new());
    let market = Arc::new(SimMarketAdaptor::new());
    let store_dyn: Arc<dyn Queries> = store.clone();
    let trade_dyn: Arc<dyn TradeAdaptor> = trade.clone();
    let market_dyn: Arc<dyn MarketAdaptor> = market.clone();
    let mut engine = Engine::new(
        config(initial_balance),
        store_dyn,
        trade_dyn,
        market_dyn,
        Arc::new(PermissiveRisk),
    );
    engine.start().await.unwrap();

    let notices = Arc::new(StdMutex::new(Vec::new()));
    let trades = Arc::new(StdMutex::new(Vec::new()));
    let strategy = Arc::new(Mutex::new(RecordingStrategy {
        id: "s1".to_string(),
        notices: Arc::clone(&notices),
        trades: Arc::clone(&trades),
    }));
    let session = engine
        .add_strategy("u1", &["cu2409".to_string()], strategy)
        .await
        .unwrap();

    let harness = Harness {
        engine,
        store,
        trade,
        market,
        notices,
        trades,
    };
    (harness, session)
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn open_with_sufficient_funds_reaches_send_running_with_one_contract_per_lot() {
    let (harness, session) = start_harness(dec!(10000)).await;
    harness.trade.set_auto_fill(false);

    let ctx = session
        .open("cu2409", Direction::Buy, dec!(1000), 2)
        .await
        .unwrap();
    harness.market.push(tick());

    wait_until(|| async { ctx.stage() == TransactionStage::SendRunning }).await;

    let contracts = harness.store.select_contracts().await.unwrap();
    let mut ids: Vec<String> = contracts.iter().map(|c| c.id.clone()).collect();
    ids.sort();
    assert_eq!(ids, vec!["1.0.0".to_string(), "1.0.1".to_string()]);
    assert!(contracts.iter().all(|c| c.state == ContractState::Opening));

    let record = ctx.snapshot().await;
    assert_eq!(record.state, "send-running");
}

#[tokio::test]
async fn open_with_insufficient_funds_aborts_with_1003_and_no_contracts() {
    let (harness, session) = start_harness(dec!(100)).await;

    let ctx = session
        .open("cu2409", Direction::Buy, dec!(1000), 2)
        .await
        .unwrap();
    harness.market.push(tick());

    let (stage, record) = ctx.join().await;
    assert_eq!(stage, TransactionStage::Aborted(1003));
    assert_eq!(record.state, "check-open;1003");
    assert!(harness.store.select_contracts().await.unwrap().is_empty());

    wait_until(|| async {
        harness
            .notices
            .lock()
            .unwrap()
            .iter()
            .any(|n| n.code == 1003)
    })
    .await;
}

#[tokio::test]
async fn full_fill_completes_the_transaction_with_a_single_good_notice() {
    let (harness, session) = start_harness(dec!(10000)).await;

    let ctx = session
        .open("cu2409", Direction::Buy, dec!(1000), 2)
        .await
        .unwrap();
    harness.market.push(tick());

    let (stage, record) = ctx.join().await;
    assert_eq!(stage, TransactionStage::Completed);
    assert_eq!(record.state, "completed;0");

    let contracts = harness.store.select_contracts().await.unwrap();
    assert_eq!(contracts.len(), 2);
    assert!(contracts.iter().all(|c| c.state == ContractState::Open));

    wait_until(|| async { !harness.trades.lock().unwrap().is_empty() }).await;
    wait_until(|| async {
        harness
            .notices
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.code == 0)
            .count()
            == 1
    })
    .await;
}

#[tokio::test]
async fn close_with_insufficient_position_aborts_with_1004() {
    let (harness, session) = start_harness(dec!(10000)).await;

    // Open two lots first so there is a position to close against.
    let open = session
        .open("cu2409", Direction::Buy, dec!(1000), 2)
        .await
        .unwrap();
    harness.market.push(tick());
    assert_eq!(open.join().await.0, TransactionStage::Completed);

    // Closing three lots exceeds the two open sell-side counterparts.
    let close = session
        .close("cu2409", Direction::Sell, dec!(1000), 3)
        .await
        .unwrap();
    harness.market.push(tick());

    let (stage, record) = close.join().await;
    assert_eq!(stage, TransactionStage::Aborted(1004));
    assert_eq!(record.state, "check-close;1004");

    // The open position is untouched.
    let contracts = harness.store.select_contracts().await.unwrap();
    assert!(contracts.iter().all(|c| c.state == ContractState::Open));
}

#[tokio::test]
async fn close_today_fills_and_releases_the_position() {
    let (harness, session) = start_harness(dec!(10000)).await;

    let open = session
        .open("cu2409", Direction::Buy, dec!(1000), 2)
        .await
        .unwrap();
    harness.market.push(tick());
    assert_eq!(open.join().await.0, TransactionStage::Completed);

    let close = session
        .close("cu2409", Direction::Sell, dec!(1010), 2)
        .await
        .unwrap();
    harness.market.push(tick());

    let (stage, _) = close.join().await;
    assert_eq!(stage, TransactionStage::Completed);

    let contracts = harness.store.select_contracts().await.unwrap();
    assert_eq!(contracts.len(), 2);
    assert!(contracts
        .iter()
        .all(|c| c.state == ContractState::Closed && c.close_price == Some(dec!(1010))));
    assert!(session.get_positions().await.unwrap().is_empty());

    // The close committed its commission alongside the open's commitment.
    let account = session.get_account().await.unwrap();
    assert_eq!(account.closing_commission, dec!(50));
    assert_eq!(account.available, dec!(10000) - dec!(2000) - dec!(50) - dec!(50));
}

#[tokio::test]
async fn committed_funds_block_a_second_open_beyond_available() {
    // Enough for one 2-lot open (2000 margin + 50 commission) and no more.
    let (harness, session) = start_harness(dec!(2060)).await;

    let first = session
        .open("cu2409", Direction::Buy, dec!(1000), 2)
        .await
        .unwrap();
    harness.market.push(tick());
    assert_eq!(first.join().await.0, TransactionStage::Completed);

    let account = session.get_account().await.unwrap();
    assert_eq!(account.opening_margin, dec!(2000));
    assert_eq!(account.opening_commission, dec!(50));
    assert_eq!(account.available, dec!(10));

    // The identical second open must see the committed funds and fail.
    let second = session
        .open("cu2409", Direction::Buy, dec!(1000), 2)
        .await
        .unwrap();
    harness.market.push(tick());

    let (stage, record) = second.join().await;
    assert_eq!(stage, TransactionStage::Aborted(1003));
    assert_eq!(record.state, "check-open;1003");
    assert_eq!(harness.store.select_contracts().await.unwrap().len(), 2);
}

#[tokio::test]
async fn rejected_open_refunds_its_committed_funds() {
    let (harness, session) = start_harness(dec!(10000)).await;
    harness.trade.set_ack_code(1002);

    let ctx = session
        .open("cu2409", Direction::Buy, dec!(1000), 2)
        .await
        .unwrap();
    harness.market.push(tick());
    assert_eq!(ctx.join().await.0, TransactionStage::Aborted(1002));

    let account = session.get_account().await.unwrap();
    assert_eq!(account.available, dec!(10000));
    assert_eq!(account.opening_margin, Decimal::ZERO);
    assert_eq!(account.opening_commission, Decimal::ZERO);
}

#[tokio::test]
async fn market_closed_parks_the_order_and_resends_on_the_next_tick() {
    let (harness, session) = start_harness(dec!(10000)).await;
    harness.trade.set_ack_code(10001);

    let ctx = session
        .open("cu2409", Direction::Buy, dec!(1000), 1)
        .await
        .unwrap();
    harness.market.push(tick());

    // The reject sends the transaction back to pending, not to a terminal
    // stage.
    wait_until(|| async { ctx.snapshot().await.state == "pending;10001" }).await;
    assert!(!ctx.stage().is_terminal());

    // Market reopens; the next tick resends the same order.
    harness.trade.set_ack_code(0);
    harness.market.push(tick());

    let (stage, _) = ctx.join().await;
    assert_eq!(stage, TransactionStage::Completed);

    // The retry reused the parked order instead of creating a second one.
    let orders = harness.store.select_orders().await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].id, "1.0");
}

#[tokio::test]
async fn rejected_open_discards_its_opening_contracts() {
    let (harness, session) = start_harness(dec!(10000)).await;
    harness.trade.set_ack_code(1002);

    let ctx = session
        .open("cu2409", Direction::Buy, dec!(1000), 2)
        .await
        .unwrap();
    harness.market.push(tick());

    let (stage, _) = ctx.join().await;
    assert_eq!(stage, TransactionStage::Aborted(1002));
    assert!(harness.store.select_contracts().await.unwrap().is_empty());
}

#[tokio::test]
async fn validation_failures_never_create_a_transaction() {
    let (harness, session) = start_harness(dec!(10000)).await;

    assert!(session
        .open("", Direction::Buy, dec!(1000), 1)
        .await
        .is_err());
    assert!(session
        .open("cu2409", Direction::Buy, dec!(0), 1)
        .await
        .is_err());
    assert!(session
        .open("cu2409", Direction::Buy, dec!(1000), 0)
        .await
        .is_err());

    assert!(harness.store.select_transactions().await.unwrap().is_empty());
}

#[tokio::test]
async fn removed_strategy_keeps_its_profile_marked_for_settlement() {
    let (harness, _session) = start_harness(dec!(10000)).await;
    harness.engine.remove_strategy("s1").await.unwrap();

    let profiles = harness.store.select_strategy_profiles().await.unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].state, "removed");
}

#[tokio::test]
async fn interrupted_strategy_is_not_armed_until_resumed() {
    let (harness, session) = start_harness(dec!(10000)).await;

    session.interrupt(true);
    let ctx = session
        .open("cu2409", Direction::Buy, dec!(1000), 1)
        .await
        .unwrap();
    harness.market.push(tick());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ctx.stage(), TransactionStage::Pending);

    session.interrupt(false);
    harness.market.push(tick());
    assert_eq!(ctx.join().await.0, TransactionStage::Completed);
}
