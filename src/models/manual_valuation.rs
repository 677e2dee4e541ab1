use std::str::FromStr;
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Holding, Id};

/// A market value recorded by hand for an instrument without a price feed,
/// e.g. a mutual fund tracked from statements. Value is in the holding's currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualValuation {
    pub holding_id: Id,
    pub date: NaiveDate,
    pub value: Decimal,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

fn legacy_note_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"Snapshot:\s*₹\s*([\d,]+(?:\.\d+)?)").ok())
        .as_ref()
}

impl ManualValuation {
    pub fn new(holding: &Holding, date: NaiveDate, value: Decimal) -> Self {
        Self {
            holding_id: holding.id.clone(),
            date,
            value,
            currency: holding.currency.clone(),
            note: None,
        }
    }

    /// Recover a value written into free-text notes as `Snapshot: ₹1,23,456`.
    ///
    /// Used once to migrate old holdings into the valuation table.
    pub fn from_legacy_note(holding: &Holding, date: NaiveDate) -> Option<Self> {
        let notes = holding.notes.as_deref()?;
        let captured = legacy_note_pattern()?.captures(notes)?.get(1)?;
        let value = Decimal::from_str(&captured.as_str().replace(',', "")).ok()?;
        Some(Self {
            holding_id: holding.id.clone(),
            date,
            value,
            currency: holding.currency.clone(),
            note: Some("migrated from holding notes".to_string()),
        })
    }
}
