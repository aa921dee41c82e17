use adapters::{MarketAdaptor, SimMarketAdaptor, SimTradeAdaptor, TradeAdaptor};
use chrono::{Duration, Timelike, Utc};
use clap::{Parser, Subcommand};
use configuration::settings::Config;
use core_types::{Direction, Instrument, Tick};
use engine::{Engine, TransactionStage};
use persistence::{Queries, SnapshotStore};
use risk::PermissiveRisk;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use settlement::SettlementEngine;
use std::path::PathBuf;
use std::sync::Arc;
use strategies::LoggingStrategy;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// The main entry point for the Meridian execution engine.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = configuration::load_config_from(&cli.config)?;

    match cli.command {
        Commands::Run(args) => run_paper_session(config, args).await,
        Commands::Settle(args) => run_settlement(config, args).await,
    }
}

// ==============================================================================
// CLI Structure
// ==============================================================================

/// An order/transaction execution engine for strategy trading.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Stem of the configuration file to load (e.g. "meridian" for
    /// meridian.toml).
    #[arg(long, default_value = "meridian")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a paper-trading session against the simulated broker and feed.
    Run(RunArgs),
    /// Settle the configured trading day from a ledger snapshot.
    Settle(SettleArgs),
}

#[derive(Parser)]
struct RunArgs {
    /// The instrument the demo strategy trades.
    #[arg(long, default_value = "cu2409")]
    instrument: String,

    /// How many scripted ticks to feed before settling down.
    #[arg(long, default_value_t = 60)]
    ticks: u32,
}

#[derive(Parser)]
struct SettleArgs {
    /// Ledger snapshot to settle (a before_settlement.json or any backup).
    #[arg(long)]
    snapshot: PathBuf,

    /// The trading day the settled accounts advance onto.
    #[arg(long)]
    next_day: String,
}

// ==============================================================================
// Paper Session
// ==============================================================================

/// Wires the engine onto the simulated broker/feed, opens and closes one
/// position, and settles the day.
async fn run_paper_session(config: Config, args: RunArgs) -> anyhow::Result<()> {
    let store = Arc::new(SnapshotStore::new());
    store
        .insert_instrument(demo_instrument(&args.instrument))
        .await?;

    let trade = Arc::new(SimTradeAdaptor::new());
    let market = Arc::new(SimMarketAdaptor::new());
    let store_dyn: Arc<dyn Queries> = store.clone();
    let trade_dyn: Arc<dyn TradeAdaptor> = trade.clone();
    let market_dyn: Arc<dyn MarketAdaptor> = market.clone();

    let mut engine = Engine::new(
        config.clone(),
        store_dyn,
        trade_dyn,
        market_dyn,
        Arc::new(PermissiveRisk),
    );
    engine.start().await?;

    let strategy = Arc::new(Mutex::new(LoggingStrategy::new("paper-demo")));
    let session = engine
        .add_strategy("paper-user", &[args.instrument.clone()], strategy)
        .await?;

    // Feed a small scripted price walk; ticks land mid-minute so they are
    // eligible to arm transactions.
    let mut price = dec!(1000);
    let mut clock = Utc::now();
    for i in 0..args.ticks {
        price += Decimal::from(i % 3) - dec!(1);
        clock += Duration::seconds(1);
        market.push(Tick {
            instrument_id: args.instrument.clone(),
            last_price: price,
            update_time: clock,
        });
    }

    let open = session
        .open(&args.instrument, Direction::Buy, price, 2)
        .await?;
    market.push(arming_tick(&args.instrument, price));
    let (stage, record) = open.join().await;
    info!(?stage, state = %record.state, "Open transaction finished");

    if stage == TransactionStage::Completed {
        let close = session
            .close(&args.instrument, Direction::Sell, price + dec!(2), 2)
            .await?;
        market.push(arming_tick(&args.instrument, price));
        let (stage, record) = close.join().await;
        info!(?stage, state = %record.state, "Close transaction finished");
    }

    let account = session.get_account().await?;
    info!(
        balance = %account.balance,
        available = %account.available,
        "Paper session account before settlement"
    );

    engine.shutdown().await?;

    let settle_store: Arc<dyn Queries> = store.clone();
    let settler = SettlementEngine::new(&config, settle_store);
    settler.settle(&config.runtime.trading_day).await?;
    let account = store
        .select_accounts()
        .await?
        .into_iter()
        .find(|a| a.user_id == "paper-user")
        .ok_or_else(|| anyhow::anyhow!("paper account vanished during settlement"))?;
    info!(
        balance = %account.balance,
        available = %account.available,
        close_profit = %account.close_profit,
        "Paper session settled"
    );
    Ok(())
}

/// A tick guaranteed to be eligible for arming: its seconds field is pinned
/// away from the 00/59 session boundaries.
fn arming_tick(instrument_id: &str, last_price: Decimal) -> Tick {
    let now = Utc::now();
    let update_time = now.with_second(30).unwrap_or(now);
    Tick {
        instrument_id: instrument_id.to_string(),
        last_price,
        update_time,
    }
}

/// A flat-fee demo schedule: 1000 margin and 25 commission per lot.
fn demo_instrument(instrument_id: &str) -> Instrument {
    Instrument {
        instrument_id: instrument_id.to_string(),
        exchange_id: "SIM".to_string(),
        multiple: dec!(5),
        amount_margin: Decimal::ZERO,
        volume_margin: dec!(1000),
        amount_commission: Decimal::ZERO,
        volume_commission: dec!(25),
        update_time: Utc::now(),
    }
}

// ==============================================================================
// Settlement Command
// ==============================================================================

async fn run_settlement(config: Config, args: SettleArgs) -> anyhow::Result<()> {
    let graph = SnapshotStore::restore(&args.snapshot).await?;
    let store: Arc<dyn Queries> = Arc::new(SnapshotStore::from_graph(graph));

    let settler = SettlementEngine::new(&config, Arc::clone(&store));
    settler.settle(&args.next_day).await?;

    for account in store.select_accounts().await? {
        info!(
            user = %account.user_id,
            balance = %account.balance,
            available = %account.available,
            trading_day = %account.trading_day,
            "Settled account"
        );
    }
    Ok(())
}
