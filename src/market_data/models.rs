use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Instrument;
use crate::models::gain_pct;

/// One daily bar of price history. Unique on `(instrument, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub instrument: Instrument,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<Decimal>,
    pub close: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,
    pub source: String,
}

impl PriceBar {
    pub fn close_only(instrument: Instrument, date: NaiveDate, close: Decimal, source: &str) -> Self {
        Self {
            instrument,
            date,
            open: None,
            high: None,
            low: None,
            close,
            volume: None,
            source: source.to_string(),
        }
    }
}

/// A live quote. `previous_close` is absent when only one session is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub instrument: Instrument,
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_close: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Price plus change against the previous close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceChange {
    pub price: Decimal,
    pub previous_close: Option<Decimal>,
    pub change: Decimal,
    pub change_pct: Decimal,
}

impl PriceChange {
    /// Only a price, no change data.
    pub fn flat(price: Decimal) -> Self {
        Self {
            price,
            previous_close: None,
            change: Decimal::ZERO,
            change_pct: Decimal::ZERO,
        }
    }
}

impl From<&Quote> for PriceChange {
    fn from(quote: &Quote) -> Self {
        match quote.previous_close.filter(|p| !p.is_zero()) {
            Some(previous) => {
                let change = quote.price - previous;
                Self {
                    price: quote.price,
                    previous_close: Some(previous),
                    change,
                    change_pct: gain_pct(change, previous),
                }
            }
            None => Self::flat(quote.price),
        }
    }
}

/// Last known price per instrument, persisted for instant ("fast") reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPrice {
    pub instrument: Instrument,
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Quote> for CachedPrice {
    fn from(quote: &Quote) -> Self {
        Self {
            instrument: quote.instrument.clone(),
            price: quote.price,
            currency: quote.currency.clone(),
            updated_at: quote.fetched_at,
        }
    }
}

/// A daily conversion rate: one `from` buys `rate` of `to`. Unique on `(from, to, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub from: String,
    pub to: String,
    pub date: NaiveDate,
    pub rate: Decimal,
    pub source: String,
}
