use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Id;
use crate::market_data::Instrument;

/// Quantities at or below this are treated as a closed position.
pub const DUST_QUANTITY: Decimal = Decimal::from_parts(1, 0, 0, false, 4);

/// Group label for holdings with no account.
pub const UNASSIGNED_ACCOUNT: &str = "UNASSIGNED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Country {
    #[serde(rename = "CA")]
    Canada,
    #[serde(rename = "IN")]
    India,
    #[serde(rename = "US")]
    UnitedStates,
}

impl Country {
    pub fn code(&self) -> &'static str {
        match self {
            Country::Canada => "CA",
            Country::India => "IN",
            Country::UnitedStates => "US",
        }
    }

    /// Currency a listing in this country trades in.
    pub fn currency(&self) -> &'static str {
        match self {
            Country::Canada => "CAD",
            Country::India => "INR",
            Country::UnitedStates => "USD",
        }
    }
}

impl fmt::Display for Country {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Country {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CA" | "CANADA" => Ok(Country::Canada),
            "IN" | "INDIA" => Ok(Country::India),
            "US" | "USA" | "UNITED STATES" => Ok(Country::UnitedStates),
            other => anyhow::bail!("Unknown country {other:?}"),
        }
    }
}

/// Known account kinds. Holdings store the raw account code so unknown
/// codes still group correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountType {
    Tfsa,
    Rrsp,
    Fhsa,
    Resp,
    Lira,
    Rrif,
    NonRegistered,
    Margin,
    Demat,
    MutualFundIndia,
    FixedDepositIndia,
    PpfIndia,
}

impl AccountType {
    pub fn from_code(code: &str) -> Option<Self> {
        let account = match code.trim().to_uppercase().as_str() {
            "TFSA" => AccountType::Tfsa,
            "RRSP" => AccountType::Rrsp,
            "FHSA" => AccountType::Fhsa,
            "RESP" => AccountType::Resp,
            "LIRA" => AccountType::Lira,
            "RRIF" => AccountType::Rrif,
            "NON_REG" => AccountType::NonRegistered,
            "MARGIN" => AccountType::Margin,
            "DEMAT" => AccountType::Demat,
            "MF_INDIA" => AccountType::MutualFundIndia,
            "FD_INDIA" => AccountType::FixedDepositIndia,
            "PPF_INDIA" => AccountType::PpfIndia,
            _ => return None,
        };
        Some(account)
    }

    pub fn label(&self) -> &'static str {
        match self {
            AccountType::Tfsa => "Tax-Free Savings Account",
            AccountType::Rrsp => "Registered Retirement Savings Plan",
            AccountType::Fhsa => "First Home Savings Account",
            AccountType::Resp => "Registered Education Savings Plan",
            AccountType::Lira => "Locked-In Retirement Account",
            AccountType::Rrif => "Registered Retirement Income Fund",
            AccountType::NonRegistered => "Non-Registered (Taxable)",
            AccountType::Margin => "Margin Account",
            AccountType::Demat => "Demat Account",
            AccountType::MutualFundIndia => "Mutual Funds (India)",
            AccountType::FixedDepositIndia => "Fixed Deposit (India)",
            AccountType::PpfIndia => "Public Provident Fund (India)",
        }
    }

    pub fn is_tax_advantaged(&self) -> bool {
        matches!(
            self,
            AccountType::Tfsa
                | AccountType::Rrsp
                | AccountType::Fhsa
                | AccountType::Resp
                | AccountType::Lira
                | AccountType::Rrif
        )
    }

    /// Fixed-income products without a market price; valued at cost.
    pub fn is_constant_value(&self) -> bool {
        matches!(self, AccountType::FixedDepositIndia | AccountType::PpfIndia)
    }
}

/// A position in one instrument within one account.
///
/// `quantity`, `avg_cost`, `is_active` and `first_purchase_date` are a
/// projection of the holding's transactions; see [`crate::portfolio::Ledger`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub id: Id,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub exchange: String,
    pub country: Country,
    pub currency: String,
    /// Account identifier such as "TFSA". Unique together with `symbol`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    pub quantity: Decimal,
    /// Weighted-average cost per unit, fees included.
    pub avg_cost: Decimal,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_purchase_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Holding {
    pub fn new(
        symbol: impl Into<String>,
        exchange: impl Into<String>,
        country: Country,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            id: Id::new(),
            symbol: symbol.into().trim().to_uppercase(),
            name: None,
            exchange: exchange.into().trim().to_uppercase(),
            country,
            currency: currency.into().trim().to_uppercase(),
            account: None,
            quantity: Decimal::ZERO,
            avg_cost: Decimal::ZERO,
            is_active: true,
            first_purchase_date: None,
            notes: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: Id) -> Self {
        self.id = id;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        let account = account.into().trim().to_uppercase();
        self.account = (!account.is_empty()).then_some(account);
        self
    }

    pub fn with_position(mut self, quantity: Decimal, avg_cost: Decimal) -> Self {
        self.quantity = quantity;
        self.avg_cost = avg_cost;
        self.is_active = quantity > DUST_QUANTITY;
        self
    }

    pub fn with_first_purchase_date(mut self, date: NaiveDate) -> Self {
        self.first_purchase_date = Some(date);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn instrument(&self) -> Instrument {
        Instrument::new(&self.symbol, &self.exchange)
    }

    pub fn account_type(&self) -> Option<AccountType> {
        self.account.as_deref().and_then(AccountType::from_code)
    }

    /// Account code used for grouping.
    pub fn account_key(&self) -> &str {
        self.account.as_deref().unwrap_or(UNASSIGNED_ACCOUNT)
    }

    /// Same instrument in the same account.
    pub fn same_position(&self, symbol: &str, account: Option<&str>) -> bool {
        self.symbol.eq_ignore_ascii_case(symbol.trim())
            && self.account.as_deref().map(str::to_uppercase)
                == account
                    .map(|a| a.trim().to_uppercase())
                    .filter(|a| !a.is_empty())
    }

    /// Fixed-income instruments that never get a market price.
    pub fn is_constant_value(&self) -> bool {
        self.account_type().is_some_and(|t| t.is_constant_value())
            || self.symbol.starts_with("FD_")
            || self.symbol.starts_with("PPF_")
    }

    /// Held on `date`: active and bought on or before it. A missing purchase date counts as held.
    pub fn is_held_on(&self, date: NaiveDate) -> bool {
        self.is_active && self.first_purchase_date.is_none_or(|first| first <= date)
    }

    pub fn cost_basis(&self) -> Decimal {
        self.quantity * self.avg_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn country_serializes_as_iso_code() {
        assert_eq!(serde_json::to_string(&Country::India).unwrap(), "\"IN\"");
        let parsed: Country = serde_json::from_str("\"CA\"").unwrap();
        assert_eq!(parsed, Country::Canada);
        assert_eq!("usa".parse::<Country>().unwrap(), Country::UnitedStates);
    }

    #[test]
    fn account_codes_classify() {
        let tfsa = AccountType::from_code("tfsa").unwrap();
        assert!(tfsa.is_tax_advantaged());
        assert!(!AccountType::NonRegistered.is_tax_advantaged());
        assert!(AccountType::FixedDepositIndia.is_constant_value());
        assert!(AccountType::from_code("CRYPTO").is_none());
    }

    #[test]
    fn eligibility_respects_first_purchase_and_active_flag() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let holding = Holding::new("XEQT", "TSX", Country::Canada, "CAD")
            .with_position(Decimal::TEN, Decimal::ONE);
        assert!(holding.is_held_on(date));

        let later = holding
            .clone()
            .with_first_purchase_date(NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
        assert!(!later.is_held_on(date));

        let closed = holding.with_position(Decimal::ZERO, Decimal::ONE);
        assert!(!closed.is_active);
        assert!(!closed.is_held_on(date));
    }

    #[test]
    fn same_position_compares_symbol_and_account() {
        let holding = Holding::new("vfv", "tsx", Country::Canada, "cad").with_account("tfsa");
        assert_eq!(holding.symbol, "VFV");
        assert!(holding.same_position("VFV", Some("TFSA")));
        assert!(!holding.same_position("VFV", Some("RRSP")));
        assert!(!holding.same_position("VFV", None));
        assert_eq!(holding.account_key(), "TFSA");
    }

    #[test]
    fn fixed_income_is_constant_value() {
        let fd = Holding::new("SBI_FD", "NA", Country::India, "INR").with_account("FD_INDIA");
        assert!(fd.is_constant_value());
        let ppf = Holding::new("PPF_SBI", "NA", Country::India, "INR");
        assert!(ppf.is_constant_value());
    }
}
