//! Point-in-time position state by replaying a holding's ledger.
//!
//! This is weighted-average costing for the open position. Realized gains
//! use FIFO lots instead; see [`super::fifo`].

use anyhow::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::{DateRange, Holding, Transaction, TransactionKind};
use crate::storage::Storage;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HoldingState {
    pub quantity: Decimal,
    /// Total cost of the open position, fees included.
    pub cost_basis: Decimal,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl HoldingState {
    pub fn avg_cost(&self) -> Decimal {
        if self.quantity.is_zero() {
            return Decimal::ZERO;
        }
        self.cost_basis / self.quantity
    }

    pub fn is_empty(&self) -> bool {
        self.quantity.is_zero()
    }
}

/// Replay `transactions` (in ledger order) dated on or before `as_of`.
///
/// BUY adds quantity and `qty * price + fees`. SELL removes cost at the
/// current average, then quantity. Neither goes below zero.
pub fn replay(transactions: &[Transaction], as_of: NaiveDate) -> HoldingState {
    let mut state = HoldingState::default();
    for txn in transactions.iter().filter(|t| t.date <= as_of) {
        match txn.kind {
            TransactionKind::Buy => {
                state.quantity += txn.quantity;
                state.cost_basis += txn.gross() + txn.fees;
            }
            TransactionKind::Sell => {
                if txn.quantity >= state.quantity {
                    if txn.quantity > state.quantity {
                        state.warnings.push(format!(
                            "{} {}: sold {} while holding {}; position clamped to zero",
                            txn.date, txn.symbol, txn.quantity, state.quantity
                        ));
                    }
                    state.quantity = Decimal::ZERO;
                    state.cost_basis = Decimal::ZERO;
                    continue;
                }
                let avg = state.avg_cost();
                state.cost_basis = (state.cost_basis - txn.quantity * avg).max(Decimal::ZERO);
                state.quantity = (state.quantity - txn.quantity).max(Decimal::ZERO);
            }
        }
    }
    state
}

/// Quantity and cost basis of `holding` at the end of `date`.
pub async fn state_at(storage: &dyn Storage, holding: &Holding, date: NaiveDate) -> Result<HoldingState> {
    let txns = storage
        .transactions_for(&holding.id, &DateRange::up_to(date))
        .await?;
    Ok(replay(&txns, date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Id;

    fn day(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    fn dec(v: i64) -> Decimal {
        Decimal::from(v)
    }

    #[test]
    fn buy_includes_fees() {
        let id = Id::new();
        let txns = vec![Transaction::buy(id, "XEQT", dec(100), dec(30), day(1, 1)).with_fees(dec(5))];
        let state = replay(&txns, day(6, 1));
        assert_eq!(state.quantity, dec(100));
        assert_eq!(state.cost_basis, dec(3005));
    }

    #[test]
    fn sell_removes_cost_at_average() {
        let id = Id::new();
        let txns = vec![
            Transaction::buy(id.clone(), "VFV", dec(10), dec(5), day(1, 1)),
            Transaction::buy(id.clone(), "VFV", dec(10), dec(15), day(1, 2)),
            Transaction::sell(id, "VFV", dec(5), dec(50), day(1, 3)),
        ];
        let state = replay(&txns, day(1, 31));
        assert_eq!(state.quantity, dec(15));
        assert_eq!(state.cost_basis, dec(150));
        assert_eq!(state.avg_cost(), dec(10));
    }

    #[test]
    fn later_events_are_ignored() {
        let id = Id::new();
        let txns = vec![
            Transaction::buy(id.clone(), "VFV", dec(10), dec(5), day(1, 1)),
            Transaction::buy(id, "VFV", dec(10), dec(15), day(3, 1)),
        ];
        assert_eq!(replay(&txns, day(2, 1)).quantity, dec(10));
        assert_eq!(replay(&txns, day(3, 1)).quantity, dec(20));
        assert!(replay(&txns, day(1, 1).pred_opt().unwrap()).is_empty());
    }

    #[test]
    fn overselling_clamps_to_zero() {
        let id = Id::new();
        let txns = vec![
            Transaction::buy(id.clone(), "VFV", dec(3), dec(10), day(1, 1)),
            Transaction::sell(id.clone(), "VFV", dec(5), dec(12), day(1, 2)),
            Transaction::buy(id, "VFV", dec(2), dec(11), day(1, 3)),
        ];
        let after_sell = replay(&txns, day(1, 2));
        assert_eq!(after_sell.quantity, Decimal::ZERO);
        assert_eq!(after_sell.cost_basis, Decimal::ZERO);
        assert_eq!(after_sell.warnings.len(), 1);

        let after_rebuy = replay(&txns, day(1, 3));
        assert_eq!(after_rebuy.quantity, dec(2));
        assert_eq!(after_rebuy.cost_basis, dec(22));
    }

    #[test]
    fn replay_is_deterministic() {
        let id = Id::new();
        let txns = vec![
            Transaction::buy(id.clone(), "VFV", dec(7), dec(13), day(1, 1)).with_fees(dec(1)),
            Transaction::sell(id.clone(), "VFV", dec(3), dec(14), day(2, 1)),
            Transaction::buy(id, "VFV", dec(4), dec(12), day(3, 1)),
        ];
        assert_eq!(replay(&txns, day(12, 31)), replay(&txns, day(12, 31)));
    }
}
