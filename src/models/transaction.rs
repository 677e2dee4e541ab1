use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionKind {
    Buy,
    Sell,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Buy => f.write_str("BUY"),
            TransactionKind::Sell => f.write_str("SELL"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(Decimal),
    #[error("price must be positive, got {0}")]
    NonPositivePrice(Decimal),
    #[error("fees must not be negative, got {0}")]
    NegativeFees(Decimal),
    #[error("symbol must not be empty")]
    EmptySymbol,
}

/// An immutable BUY or SELL event. Ordered within a holding by
/// `(date, insertion order)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Id,
    pub holding_id: Id,
    pub symbol: String,
    pub kind: TransactionKind,
    pub quantity: Decimal,
    pub price: Decimal,
    #[serde(default)]
    pub fees: Decimal,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        holding_id: Id,
        symbol: impl Into<String>,
        kind: TransactionKind,
        quantity: Decimal,
        price: Decimal,
        date: NaiveDate,
    ) -> Self {
        Self {
            id: Id::new(),
            holding_id,
            symbol: symbol.into().trim().to_uppercase(),
            kind,
            quantity,
            price,
            fees: Decimal::ZERO,
            date,
            notes: None,
            created_at: Utc::now(),
        }
    }

    pub fn buy(holding_id: Id, symbol: &str, quantity: Decimal, price: Decimal, date: NaiveDate) -> Self {
        Self::new(holding_id, symbol, TransactionKind::Buy, quantity, price, date)
    }

    pub fn sell(holding_id: Id, symbol: &str, quantity: Decimal, price: Decimal, date: NaiveDate) -> Self {
        Self::new(holding_id, symbol, TransactionKind::Sell, quantity, price, date)
    }

    pub fn with_fees(mut self, fees: Decimal) -> Self {
        self.fees = fees;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_id(mut self, id: Id) -> Self {
        self.id = id;
        self
    }

    pub fn validate(&self) -> Result<(), TransactionError> {
        if self.symbol.trim().is_empty() {
            return Err(TransactionError::EmptySymbol);
        }
        if self.quantity <= Decimal::ZERO {
            return Err(TransactionError::NonPositiveQuantity(self.quantity));
        }
        if self.price <= Decimal::ZERO {
            return Err(TransactionError::NonPositivePrice(self.price));
        }
        if self.fees < Decimal::ZERO {
            return Err(TransactionError::NegativeFees(self.fees));
        }
        Ok(())
    }

    pub fn gross(&self) -> Decimal {
        self.quantity * self.price
    }

    /// Key used to recognise the same event arriving twice from an import.
    pub fn dedup_key(&self) -> String {
        dedup_key(self.date, &self.symbol, self.kind, self.quantity, self.price)
    }
}

pub fn dedup_key(
    date: NaiveDate,
    symbol: &str,
    kind: TransactionKind,
    quantity: Decimal,
    price: Decimal,
) -> String {
    format!(
        "{date}|{}|{kind}|{}|{}",
        symbol.trim().to_uppercase(),
        quantity.normalize(),
        price.normalize()
    )
}

/// Stable sort into ledger order. Same-day events keep their insertion order.
pub fn sort_ledger(transactions: &mut [Transaction]) {
    transactions.sort_by_key(|t| t.date);
}
