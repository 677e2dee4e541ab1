use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Country;

/// Whole-portfolio valuation for one calendar date, in the base currency.
///
/// Derived from the ledger and point-in-time prices; can always be rebuilt by replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub date: NaiveDate,
    pub currency: String,
    pub total_value: Decimal,
    pub total_cost: Decimal,
    pub unrealized_gain: Decimal,
    pub unrealized_gain_pct: Decimal,
    pub holdings_count: usize,
    #[serde(default)]
    pub value_by_country: BTreeMap<Country, Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PortfolioSnapshot {
    /// Overwrite the valuation fields, keeping `created_at`.
    pub fn refresh_from(&mut self, other: &PortfolioSnapshot) {
        self.currency = other.currency.clone();
        self.total_value = other.total_value;
        self.total_cost = other.total_cost;
        self.unrealized_gain = other.unrealized_gain;
        self.unrealized_gain_pct = other.unrealized_gain_pct;
        self.holdings_count = other.holdings_count;
        self.value_by_country = other.value_by_country.clone();
        self.updated_at = other.updated_at;
    }

    /// Same valuation, ignoring timestamps.
    pub fn same_totals(&self, other: &PortfolioSnapshot) -> bool {
        self.date == other.date
            && self.currency == other.currency
            && self.total_value == other.total_value
            && self.total_cost == other.total_cost
            && self.unrealized_gain == other.unrealized_gain
            && self.unrealized_gain_pct == other.unrealized_gain_pct
            && self.holdings_count == other.holdings_count
            && self.value_by_country == other.value_by_country
    }
}

/// `gain / cost * 100`, or zero when there is no cost.
pub fn gain_pct(gain: Decimal, cost: Decimal) -> Decimal {
    if cost.is_zero() {
        return Decimal::ZERO;
    }
    gain.checked_div(cost)
        .map(|ratio| ratio * Decimal::ONE_HUNDRED)
        .unwrap_or(Decimal::ZERO)
}
