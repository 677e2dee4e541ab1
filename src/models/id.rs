use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{value:?} cannot name a holding directory")]
pub struct IdError {
    value: String,
}

/// Holding or ledger entry id, a v4 UUID unless loaded from disk.
///
/// `JsonFileStorage` keeps each holding under `holdings/<id>/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl Id {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Unchecked. Directory names read back from disk go through [`Id::parse`].
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn parse(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        if Self::is_path_safe(&value) {
            Ok(Self(value))
        } else {
            Err(IdError { value })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// One path segment: non-empty, not `.`/`..`, no separators or NUL.
    pub fn is_path_safe(value: &str) -> bool {
        !matches!(value, "" | "." | "..") && !value.contains(['/', '\\', '\0'])
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Country, Holding, Transaction};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    #[test]
    fn holdings_and_their_transactions_get_distinct_ids() {
        let holding = Holding::new("XEQT", "TSX", Country::Canada, "CAD");
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let buy = Transaction::buy(holding.id.clone(), "XEQT", Decimal::ONE, Decimal::TEN, date);

        assert_eq!(buy.holding_id, holding.id);
        assert_ne!(buy.id, holding.id);
        assert!(Id::is_path_safe(holding.id.as_str()));
        assert_eq!(Uuid::parse_str(holding.id.as_str()).ok().map(|u| u.get_version_num()), Some(4));
    }

    #[test]
    fn directory_names_that_escape_holdings_are_rejected() {
        for bad in ["", ".", "..", "../ledger", "tfsa/xeqt", "tfsa\\xeqt", "xeqt\0"] {
            assert!(Id::parse(bad).is_err(), "{bad:?} should be rejected");
        }
        assert_eq!(
            Id::parse("..").unwrap_err().to_string(),
            "\"..\" cannot name a holding directory"
        );
        let legacy = Id::parse("xeqt-tfsa-2019").unwrap();
        assert_eq!(legacy.to_string(), "xeqt-tfsa-2019");
    }
}
