use crate::enums::{ContractState, Direction, Offset, OrderOffset};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A strategy's request to open or close position, as tracked by the
/// scheduler. Owns its orders through `Order::transaction_id` back-links.
///
/// `state` is a free-text tag with an embedded failure code where relevant
/// (see [`crate::codes::state_tag`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub strategy_id: String,
    pub instrument_id: String,
    pub direction: Direction,
    pub offset: Offset,
    pub price: Decimal,
    pub volume: u32,
    pub trading_day: String,
    pub state: String,
    pub state_message: String,
    pub update_time: DateTime<Utc>,
}

/// A single broker order produced by a transaction. An open transaction
/// produces one order; a close transaction produces up to two (today lots
/// and history lots).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub transaction_id: String,
    pub instrument_id: String,
    pub price: Decimal,
    pub volume: u32,
    pub direction: Direction,
    pub offset: OrderOffset,
    pub state: String,
    pub trading_day: String,
}

/// One lot of held position, independently tracked through its lifecycle.
///
/// Invariant: a contract is locked by exactly one order at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: String,
    pub user_id: String,
    pub instrument_id: String,
    pub direction: Direction,
    /// Open price. Requested price while `Opening`, real fill price once
    /// `Open`, settlement price after an end-of-day roll.
    pub price: Decimal,
    pub state: ContractState,
    pub open_trading_day: String,
    pub open_time: DateTime<Utc>,
    /// Fill price of the closing trade; only set once the contract closes.
    pub close_price: Option<Decimal>,
}

/// An immutable fill record appended to an order, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub order_id: String,
    pub instrument_id: String,
    pub price: Decimal,
    pub volume: u32,
    pub trading_day: String,
    pub update_time: DateTime<Utc>,
}

/// The only externally pushed market fact the router retains: the last value
/// per instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument_id: String,
    pub last_price: Decimal,
    pub update_time: DateTime<Utc>,
}

/// An aggregated bar delivered to strategies. The engine routes bars; it does
/// not synthesize them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub instrument_id: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub trading_day: String,
    pub update_time: DateTime<Utc>,
}

/// Per-user balance sheet. Mutated only by the settlement engine and by the
/// balance checks performed while allocating an open/close transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub balance: Decimal,
    pub margin: Decimal,
    pub commission: Decimal,
    pub opening_margin: Decimal,
    pub opening_commission: Decimal,
    pub closing_commission: Decimal,
    pub available: Decimal,
    pub position_profit: Decimal,
    pub close_profit: Decimal,
    pub yd_balance: Decimal,
    pub trading_day: String,
}

/// The margin/commission schedule for one instrument.
///
/// Both margin and commission are either amount-based (a ratio of
/// `price * multiple`) or volume-based (a flat amount per lot); an amount
/// ratio of zero selects the volume-based figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub instrument_id: String,
    pub exchange_id: String,
    /// Contract multiplier: lots-to-notional conversion factor.
    pub multiple: Decimal,
    pub amount_margin: Decimal,
    pub volume_margin: Decimal,
    pub amount_commission: Decimal,
    pub volume_commission: Decimal,
    pub update_time: DateTime<Utc>,
}

impl Instrument {
    /// Margin locked per lot at the given price.
    pub fn margin_per_lot(&self, price: Decimal) -> Decimal {
        if self.amount_margin.is_zero() {
            self.volume_margin
        } else {
            price * self.multiple * self.amount_margin
        }
    }

    /// Commission charged per lot at the given price.
    pub fn commission_per_lot(&self, price: Decimal) -> Decimal {
        if self.amount_commission.is_zero() {
            self.volume_commission
        } else {
            price * self.multiple * self.amount_commission
        }
    }
}

/// A registered strategy's durable profile: who owns it and which instruments
/// it wants ticks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyProfile {
    pub strategy_id: String,
    pub user_id: String,
    pub instrument_ids: Vec<String>,
    /// `"normal"` or `"removed"`; removed profiles are dropped at settlement.
    pub state: String,
    pub create_time: DateTime<Utc>,
}

/// A trading account owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub create_time: DateTime<Utc>,
}

/// A coded message delivered asynchronously back to the originating strategy.
/// Every coded failure in the system eventually surfaces as one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub code: i32,
    pub message: String,
    pub transaction_id: Option<String>,
    pub order_id: Option<String>,
}

impl Notice {
    /// Creates a notice with no transaction/order context.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            transaction_id: None,
            order_id: None,
        }
    }

    /// Creates a notice attributed to a transaction and, optionally, one of
    /// its orders.
    pub fn for_transaction(
        code: i32,
        message: impl Into<String>,
        transaction_id: impl Into<String>,
        order_id: Option<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            transaction_id: Some(transaction_id.into()),
            order_id,
        }
    }

    /// True when the notice reports success.
    pub fn is_good(&self) -> bool {
        self.code == crate::codes::OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn instrument(amount_margin: Decimal, volume_margin: Decimal) -> Instrument {
        Instrument {
            instrument_id: "cu2409".to_string(),
            exchange_id: "SHFE".to_string(),
            multiple: dec!(5),
            amount_margin,
            volume_margin,
            amount_commission: dec!(0),
            volume_commission: dec!(50),
            update_time: Utc::now(),
        }
    }

    #[test]
    fn amount_margin_scales_with_price() {
        let inst = instrument(dec!(0.1), dec!(0));
        assert_eq!(inst.margin_per_lot(dec!(1000)), dec!(500));
    }

    #[test]
    fn zero_amount_ratio_selects_volume_figure() {
        let inst = instrument(dec!(0), dec!(2000));
        assert_eq!(inst.margin_per_lot(dec!(1000)), dec!(2000));
        assert_eq!(inst.commission_per_lot(dec!(1000)), dec!(50));
    }
}
