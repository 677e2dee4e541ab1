mod holding;
mod id;
mod manual_valuation;
mod snapshot;
mod transaction;

use chrono::NaiveDate;

pub use holding::{AccountType, Country, Holding, DUST_QUANTITY, UNASSIGNED_ACCOUNT};
pub use id::{Id, IdError};
pub use manual_valuation::ManualValuation;
pub use snapshot::{gain_pct, PortfolioSnapshot};
pub use transaction::{
    dedup_key, sort_ledger, Transaction, TransactionError, TransactionKind,
};

/// Inclusive calendar range; an open end is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn up_to(end: NaiveDate) -> Self {
        Self {
            start: None,
            end: Some(end),
        }
    }

    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.is_none_or(|start| date >= start) && self.end.is_none_or(|end| date <= end)
    }
}
