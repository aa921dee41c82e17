use crate::error::SettlementError;
use core_types::{Account, Contract, ContractState, Direction, Instrument};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Profit of one lot between two prices, signed by direction.
pub fn profit(
    direction: Direction,
    open_price: Decimal,
    current_price: Decimal,
    multiple: Decimal,
) -> Decimal {
    match direction {
        Direction::Buy => (current_price - open_price) * multiple,
        Direction::Sell => (open_price - current_price) * multiple,
    }
}

/// The outcome of rolling one user's contracts over the day boundary.
#[derive(Debug, Default)]
pub struct ContractRoll {
    /// Contracts surviving into the next day (open, including reverted
    /// closing lots).
    pub kept: Vec<Contract>,
    /// Ids of contracts removed from the ledger (abandoned opening lots and
    /// finished closed lots).
    pub dropped: Vec<String>,
    pub margin: Decimal,
    pub commission: Decimal,
    pub close_profit: Decimal,
    pub position_profit: Decimal,
}

/// Rolls one user's contracts:
///
/// - `closing` reverts to `open` with its price moved to the settlement
///   price (the close never filled);
/// - `opening` is dropped (the position never materialized);
/// - `open` is kept and accrues margin and position profit, plus commission
///   if it was opened today;
/// - `closed` is dropped and accrues close profit and commission.
///
/// A missing settlement price or instrument schedule for any surviving
/// contract fails the whole roll; profits and margin cannot be computed
/// without them.
pub fn roll_contracts(
    contracts: Vec<Contract>,
    instruments: &HashMap<String, Instrument>,
    settlement_prices: &HashMap<String, Decimal>,
    trading_day: &str,
) -> Result<ContractRoll, SettlementError> {
    let mut roll = ContractRoll::default();

    for mut contract in contracts {
        match contract.state {
            ContractState::Opening => {
                roll.dropped.push(contract.id);
                continue;
            }
            ContractState::Closing => {
                let settle = price_of(settlement_prices, &contract.instrument_id)?;
                contract.state = ContractState::Open;
                contract.price = settle;
                contract.close_price = None;
            }
            ContractState::Open | ContractState::Closed => {}
        }

        let instrument = instruments
            .get(&contract.instrument_id)
            .ok_or_else(|| SettlementError::MissingInstrument(contract.instrument_id.clone()))?;
        let opened_today = contract.open_trading_day == trading_day;

        match contract.state {
            ContractState::Open => {
                let settle = price_of(settlement_prices, &contract.instrument_id)?;
                roll.margin += instrument.margin_per_lot(contract.price);
                roll.position_profit +=
                    profit(contract.direction, contract.price, settle, instrument.multiple);
                if opened_today {
                    roll.commission += instrument.commission_per_lot(contract.price);
                }
                roll.kept.push(contract);
            }
            ContractState::Closed => {
                let close_price = contract.close_price.unwrap_or(contract.price);
                roll.close_profit +=
                    profit(contract.direction, contract.price, close_price, instrument.multiple);
                roll.commission += instrument.commission_per_lot(close_price);
                if opened_today {
                    roll.commission += instrument.commission_per_lot(contract.price);
                }
                roll.dropped.push(contract.id);
            }
            // Unreachable: opening was dropped and closing reverted above.
            ContractState::Opening | ContractState::Closing => {}
        }
    }

    Ok(roll)
}

/// Applies a contract roll to an account: yesterday's balance is fixed to
/// the pre-settlement balance, the accumulators take the day's values, and
/// the trading day advances.
pub fn roll_account(account: &Account, roll: &ContractRoll, next_trading_day: &str) -> Account {
    let yd_balance = account.balance;
    let balance = yd_balance + roll.close_profit + roll.position_profit - roll.commission;
    Account {
        user_id: account.user_id.clone(),
        balance,
        margin: roll.margin,
        commission: roll.commission,
        opening_margin: Decimal::ZERO,
        opening_commission: Decimal::ZERO,
        closing_commission: Decimal::ZERO,
        available: balance - roll.margin - roll.commission,
        position_profit: roll.position_profit,
        close_profit: roll.close_profit,
        yd_balance,
        trading_day: next_trading_day.to_string(),
    }
}

fn price_of(
    settlement_prices: &HashMap<String, Decimal>,
    instrument_id: &str,
) -> Result<Decimal, SettlementError> {
    settlement_prices
        .get(instrument_id)
        .copied()
        .ok_or_else(|| SettlementError::MissingPrice(instrument_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

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

    fn contract(id: &str, state: ContractState, open_day: &str) -> Contract {
        Contract {
            id: id.to_string(),
            user_id: "u1".to_string(),
            instrument_id: "cu2409".to_string(),
            direction: Direction::Buy,
            price: dec!(1000),
            state,
            open_trading_day: open_day.to_string(),
            open_time: Utc::now(),
            close_price: None,
        }
    }

    fn account(balance: Decimal) -> Account {
        Account {
            user_id: "u1".to_string(),
            balance,
            margin: Decimal::ZERO,
            commission: Decimal::ZERO,
            opening_margin: Decimal::ZERO,
            opening_commission: Decimal::ZERO,
            closing_commission: Decimal::ZERO,
            available: balance,
            position_profit: Decimal::ZERO,
            close_profit: Decimal::ZERO,
            yd_balance: balance,
            trading_day: "20260827".to_string(),
        }
    }

    fn tables() -> (HashMap<String, Instrument>, HashMap<String, Decimal>) {
        let instruments = HashMap::from([("cu2409".to_string(), instrument())]);
        let prices = HashMap::from([("cu2409".to_string(), dec!(1010))]);
        (instruments, prices)
    }

    #[test]
    fn single_open_contract_conserves_balance() {
        let (instruments, prices) = tables();
        let roll = roll_contracts(
            vec![contract("1.0.0", ContractState::Open, "20260827")],
            &instruments,
            &prices,
            "20260827",
        )
        .unwrap();

        // Position profit (1010 - 1000) * 5, commission 25 (opened today).
        assert_eq!(roll.position_profit, dec!(50));
        assert_eq!(roll.commission, dec!(25));
        assert_eq!(roll.margin, dec!(1000));

        let before = account(dec!(10000));
        let after = roll_account(&before, &roll, "20260828");
        assert_eq!(
            after.balance,
            before.balance + roll.position_profit - roll.commission
        );
        assert_eq!(after.available, after.balance - after.margin - after.commission);
        assert_eq!(after.yd_balance, before.balance);
        assert_eq!(after.trading_day, "20260828");
    }

    #[test]
    fn history_open_contract_pays_no_commission() {
        let (instruments, prices) = tables();
        let roll = roll_contracts(
            vec![contract("1.0.0", ContractState::Open, "20260820")],
            &instruments,
            &prices,
            "20260827",
        )
        .unwrap();
        assert_eq!(roll.commission, Decimal::ZERO);
        assert_eq!(roll.position_profit, dec!(50));
    }

    #[test]
    fn unfilled_lots_are_dropped_or_reverted() {
        let (instruments, prices) = tables();
        let roll = roll_contracts(
            vec![
                contract("1.0.0", ContractState::Opening, "20260827"),
                contract("2.0.0", ContractState::Closing, "20260820"),
            ],
            &instruments,
            &prices,
            "20260827",
        )
        .unwrap();

        assert_eq!(roll.dropped, vec!["1.0.0".to_string()]);
        assert_eq!(roll.kept.len(), 1);
        let reverted = &roll.kept[0];
        assert_eq!(reverted.state, ContractState::Open);
        // The reverted lot is re-based onto the settlement price, so it
        // carries no position profit into the roll.
        assert_eq!(reverted.price, dec!(1010));
        assert_eq!(roll.position_profit, Decimal::ZERO);
    }

    #[test]
    fn closed_contract_realizes_close_profit() {
        let (instruments, prices) = tables();
        let mut closed = contract("1.0.0", ContractState::Closed, "20260820");
        closed.close_price = Some(dec!(1020));
        let roll =
            roll_contracts(vec![closed], &instruments, &prices, "20260827").unwrap();

        assert_eq!(roll.close_profit, dec!(100));
        assert_eq!(roll.commission, dec!(25));
        assert!(roll.kept.is_empty());
        assert_eq!(roll.dropped, vec!["1.0.0".to_string()]);
    }

    #[test]
    fn missing_price_for_live_contract_fails_the_roll() {
        let (instruments, _) = tables();
        let err = roll_contracts(
            vec![contract("1.0.0", ContractState::Open, "20260827")],
            &instruments,
            &HashMap::new(),
            "20260827",
        )
        .unwrap_err();
        assert!(matches!(err, SettlementError::MissingPrice(id) if id == "cu2409"));
    }

    #[test]
    fn sell_side_profit_is_inverted() {
        assert_eq!(profit(Direction::Sell, dec!(1000), dec!(990), dec!(5)), dec!(50));
        assert_eq!(profit(Direction::Buy, dec!(1000), dec!(990), dec!(5)), dec!(-50));
    }
}
