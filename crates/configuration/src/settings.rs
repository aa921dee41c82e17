use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

/// The root configuration structure for the entire application.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub runtime: Runtime,
    pub scheduler: Scheduler,
    pub callbacks: Callbacks,
    pub market: Market,
}

/// Process-level settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Runtime {
    /// Root directory for per-trading-day snapshot backups.
    pub data_dir: String,
    /// The logical business date to run under (e.g. "20260827").
    pub trading_day: String,
    /// Starting balance used when a user's account is bootstrapped.
    pub initial_balance: Decimal,
}

/// Parameters of the transaction scheduler worker.
#[derive(Debug, Clone, Deserialize)]
pub struct Scheduler {
    /// Capacity of the armed-transaction queue. Arming beyond this is skipped
    /// and logged as backpressure, never treated as an error.
    pub armed_queue_capacity: usize,
    /// How long the worker waits for the broker's first acknowledgement of a
    /// submitted order before synthesizing a timeout (code 3001).
    pub ack_timeout_secs: u64,
}

/// Execution budgets for strategy callbacks.
#[derive(Debug, Clone, Deserialize)]
pub struct Callbacks {
    /// Budget for tick/bar/trade/notice callbacks, in seconds.
    pub data_budget_secs: u64,
    /// Budget for lifecycle callbacks (start/stop/destroy), in seconds.
    pub lifecycle_budget_secs: u64,
}

/// Market-data routing parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct Market {
    /// Instruments whose last tick is older than this many days are treated
    /// as expired and not resubscribed on reconnect.
    pub stale_tick_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime: Runtime {
                data_dir: "data".to_string(),
                trading_day: "19700101".to_string(),
                initial_balance: dec!(0),
            },
            scheduler: Scheduler {
                armed_queue_capacity: 128,
                ack_timeout_secs: 5,
            },
            callbacks: Callbacks {
                data_budget_secs: 1,
                lifecycle_budget_secs: 5,
            },
            market: Market { stale_tick_days: 30 },
        }
    }
}
