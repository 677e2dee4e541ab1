//! Writes to holdings and their transaction ledgers.
//!
//! A holding's `quantity`, `avg_cost`, `is_active` and `first_purchase_date`
//! are recomputed from its ledger after every change.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::reconstruct::replay;
use crate::clock::{Clock, SystemClock};
use crate::models::{
    dedup_key, Country, DateRange, Holding, Id, Transaction, TransactionError, TransactionKind,
    DUST_QUANTITY,
};
use crate::storage::Storage;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    InvalidTransaction(#[from] TransactionError),
    #[error("holding {0} not found")]
    HoldingNotFound(Id),
    #[error("{symbol} is already held in account {account}")]
    DuplicateHolding { symbol: String, account: String },
    #[error("no valid transactions to import")]
    NothingToImport,
}

/// Fields for a new holding. A position given here is recorded as an opening BUY.
#[derive(Debug, Clone)]
pub struct NewHolding {
    pub symbol: String,
    pub exchange: String,
    pub country: Country,
    pub currency: String,
    pub account: Option<String>,
    pub name: Option<String>,
    pub notes: Option<String>,
    pub quantity: Option<Decimal>,
    pub avg_cost: Option<Decimal>,
    pub purchase_date: Option<NaiveDate>,
}

impl NewHolding {
    pub fn new(symbol: &str, exchange: &str, country: Country, currency: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            country,
            currency: currency.to_string(),
            account: None,
            name: None,
            notes: None,
            quantity: None,
            avg_cost: None,
            purchase_date: None,
        }
    }

    pub fn with_account(mut self, account: &str) -> Self {
        self.account = Some(account.to_string());
        self
    }

    pub fn with_position(mut self, quantity: Decimal, avg_cost: Decimal, date: NaiveDate) -> Self {
        self.quantity = Some(quantity);
        self.avg_cost = Some(avg_cost);
        self.purchase_date = Some(date);
        self
    }
}

/// One parsed row of a broker export.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImportRecord {
    pub date: NaiveDate,
    pub symbol: String,
    pub exchange: String,
    pub country: Country,
    pub currency: String,
    #[serde(default)]
    pub account: Option<String>,
    pub kind: TransactionKind,
    pub quantity: Decimal,
    pub price: Decimal,
    #[serde(default)]
    pub fees: Decimal,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ImportRecord {
    fn dedup_key(&self) -> String {
        dedup_key(self.date, &self.symbol, self.kind, self.quantity, self.price)
    }

    fn position_key(&self) -> (String, Option<String>) {
        (
            self.symbol.trim().to_uppercase(),
            self.account
                .as_deref()
                .map(|a| a.trim().to_uppercase())
                .filter(|a| !a.is_empty()),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub duplicates: usize,
    pub holdings_created: usize,
    pub holdings_reactivated: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportPreview {
    pub records: usize,
    pub new_symbols: Vec<String>,
    pub existing_symbols: Vec<String>,
    pub potential_duplicates: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub errors: Vec<String>,
}

pub struct Ledger {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl Ledger {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    async fn find_position(&self, symbol: &str, account: Option<&str>) -> Result<Option<Holding>> {
        Ok(self
            .storage
            .list_holdings()
            .await?
            .into_iter()
            .find(|h| h.same_position(symbol, account)))
    }

    pub async fn create_holding(&self, new: NewHolding) -> Result<Holding> {
        if new.symbol.trim().is_empty() {
            return Err(LedgerError::from(TransactionError::EmptySymbol).into());
        }
        if let Some(existing) = self.find_position(&new.symbol, new.account.as_deref()).await? {
            return Err(LedgerError::DuplicateHolding {
                symbol: existing.symbol.clone(),
                account: existing.account_key().to_string(),
            }
            .into());
        }

        let mut holding = Holding::new(&new.symbol, &new.exchange, new.country, &new.currency);
        if let Some(account) = &new.account {
            holding = holding.with_account(account);
        }
        holding.name = new.name;
        holding.notes = new.notes;
        holding.is_active = false;

        let opening = match (new.quantity, new.avg_cost) {
            (Some(quantity), Some(avg_cost)) if quantity > Decimal::ZERO => {
                let date = new.purchase_date.unwrap_or_else(|| self.clock.today());
                let txn = Transaction::buy(holding.id.clone(), &holding.symbol, quantity, avg_cost, date)
                    .with_notes("opening position");
                txn.validate().map_err(LedgerError::from)?;
                Some(txn)
            }
            _ => None,
        };

        if opening.is_none() {
            holding.first_purchase_date = new.purchase_date;
        }

        self.storage.save_holding(&holding).await?;
        if let Some(txn) = opening {
            self.storage
                .append_transactions(&holding.id, std::slice::from_ref(&txn))
                .await?;
            holding = self.rebuild_projection(&holding.id).await?;
        }
        info!(symbol = %holding.symbol, account = %holding.account_key(), "holding created");
        Ok(holding)
    }

    /// Append one BUY or SELL and refresh the holding.
    pub async fn record(
        &self,
        holding_id: &Id,
        kind: TransactionKind,
        quantity: Decimal,
        price: Decimal,
        fees: Decimal,
        date: NaiveDate,
    ) -> Result<Transaction> {
        let holding = self
            .storage
            .get_holding(holding_id)
            .await?
            .ok_or_else(|| LedgerError::HoldingNotFound(holding_id.clone()))?;

        let txn = Transaction::new(holding.id.clone(), &holding.symbol, kind, quantity, price, date)
            .with_fees(fees);
        txn.validate().map_err(LedgerError::from)?;

        if kind == TransactionKind::Sell {
            let held = replay(
                &self.storage.transactions_for(&holding.id, &DateRange::up_to(date)).await?,
                date,
            );
            if quantity > held.quantity {
                warn!(
                    symbol = %holding.symbol,
                    date = %date,
                    selling = %quantity,
                    held = %held.quantity,
                    "selling more than held"
                );
            }
        }

        self.storage
            .append_transactions(&holding.id, std::slice::from_ref(&txn))
            .await?;
        self.rebuild_projection(&holding.id).await?;
        debug!(symbol = %holding.symbol, kind = %kind, quantity = %quantity, date = %date, "transaction recorded");
        Ok(txn)
    }

    /// Recompute a holding's position fields from its full ledger. Holdings
    /// without transactions keep what they have.
    pub async fn rebuild_projection(&self, holding_id: &Id) -> Result<Holding> {
        let mut holding = self
            .storage
            .get_holding(holding_id)
            .await?
            .ok_or_else(|| LedgerError::HoldingNotFound(holding_id.clone()))?;
        let txns = self
            .storage
            .transactions_for(holding_id, &DateRange::all())
            .await?;
        if txns.is_empty() {
            return Ok(holding);
        }

        let state = replay(&txns, NaiveDate::MAX);
        for warning in &state.warnings {
            warn!(symbol = %holding.symbol, "{warning}");
        }
        holding.quantity = state.quantity;
        holding.avg_cost = state.avg_cost();
        holding.is_active = state.quantity > DUST_QUANTITY;
        holding.first_purchase_date = txns
            .iter()
            .filter(|t| t.kind == TransactionKind::Buy)
            .map(|t| t.date)
            .min();
        self.storage.save_holding(&holding).await?;
        Ok(holding)
    }

    pub async fn rebuild_all(&self) -> Result<usize> {
        let holdings = self.storage.list_holdings().await?;
        for holding in &holdings {
            self.rebuild_projection(&holding.id).await?;
        }
        info!(holdings = holdings.len(), "projections rebuilt");
        Ok(holdings.len())
    }

    /// What [`Self::import`] would do, without writing anything.
    pub async fn preview_import(&self, records: &[ImportRecord]) -> Result<ImportPreview> {
        let holdings = self.storage.list_holdings().await?;
        let known: HashSet<String> = self
            .storage
            .all_transactions()
            .await?
            .iter()
            .map(Transaction::dedup_key)
            .collect();

        let mut preview = ImportPreview {
            records: records.len(),
            ..ImportPreview::default()
        };
        let mut new_symbols = HashSet::new();
        let mut existing_symbols = HashSet::new();
        for (index, record) in records.iter().enumerate() {
            if let Err(e) = record_transaction(record, Id::new()).validate() {
                preview.errors.push(format!("record {}: {e}", index + 1));
                continue;
            }
            if known.contains(&record.dedup_key()) {
                preview.potential_duplicates += 1;
            }
            let (symbol, account) = record.position_key();
            if holdings.iter().any(|h| h.same_position(&symbol, account.as_deref())) {
                existing_symbols.insert(symbol);
            } else {
                new_symbols.insert(symbol);
            }
            preview.first_date = Some(preview.first_date.map_or(record.date, |d| d.min(record.date)));
            preview.last_date = Some(preview.last_date.map_or(record.date, |d| d.max(record.date)));
        }
        preview.new_symbols = sorted(new_symbols);
        preview.existing_symbols = sorted(existing_symbols);
        Ok(preview)
    }

    /// Append parsed records to their holdings, skipping ones already in the
    /// ledger. Fails only when no record is valid.
    pub async fn import(&self, mut records: Vec<ImportRecord>) -> Result<ImportReport> {
        let mut report = ImportReport::default();
        let mut seen: HashSet<String> = self
            .storage
            .all_transactions()
            .await?
            .iter()
            .map(Transaction::dedup_key)
            .collect();

        records.sort_by_key(|r| r.date);
        let mut valid = 0;
        let mut groups: BTreeMap<(String, Option<String>), Vec<ImportRecord>> = BTreeMap::new();
        for record in records {
            if let Err(e) = record_transaction(&record, Id::new()).validate() {
                report
                    .errors
                    .push(format!("{} {}: {e}", record.date, record.symbol));
                continue;
            }
            valid += 1;
            if !seen.insert(record.dedup_key()) {
                report.duplicates += 1;
                continue;
            }
            groups.entry(record.position_key()).or_default().push(record);
        }
        if valid == 0 {
            return Err(LedgerError::NothingToImport.into());
        }

        let holdings = self.storage.list_holdings().await?;
        for ((symbol, account), group) in groups {
            let Some(first) = group.first() else {
                continue;
            };
            let holding = match holdings
                .iter()
                .find(|h| h.same_position(&symbol, account.as_deref()))
            {
                Some(existing) => {
                    if !existing.is_active {
                        report.holdings_reactivated += 1;
                    }
                    existing.clone()
                }
                None => {
                    let mut holding =
                        Holding::new(&symbol, &first.exchange, first.country, &first.currency);
                    if let Some(account) = &account {
                        holding = holding.with_account(account);
                    }
                    holding.name = first.name.clone();
                    self.storage.save_holding(&holding).await?;
                    report.holdings_created += 1;
                    holding
                }
            };

            let txns: Vec<Transaction> = group
                .iter()
                .map(|r| record_transaction(r, holding.id.clone()))
                .collect();
            self.storage.append_transactions(&holding.id, &txns).await?;
            report.imported += txns.len();

            let rebuilt = self.rebuild_projection(&holding.id).await?;
            if !rebuilt.is_active {
                report
                    .warnings
                    .push(format!("{symbol}: position is closed after import"));
            }
        }

        info!(
            imported = report.imported,
            duplicates = report.duplicates,
            created = report.holdings_created,
            "import finished"
        );
        Ok(report)
    }
}

fn record_transaction(record: &ImportRecord, holding_id: Id) -> Transaction {
    let mut txn = Transaction::new(
        holding_id,
        &record.symbol,
        record.kind,
        record.quantity,
        record.price,
        record.date,
    )
    .with_fees(record.fees);
    txn.notes = record.notes.clone();
    txn
}

fn sorted(set: HashSet<String>) -> Vec<String> {
    let mut values: Vec<String> = set.into_iter().collect();
    values.sort();
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::storage::MemoryStorage;

    fn day(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    fn dec(v: i64) -> Decimal {
        Decimal::from(v)
    }

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryStorage::new()))
            .with_clock(Arc::new(FixedClock::on_date(day(6, 3))))
    }

    fn record(date: NaiveDate, symbol: &str, kind: TransactionKind, qty: i64, price: i64) -> ImportRecord {
        ImportRecord {
            date,
            symbol: symbol.to_string(),
            exchange: "TSX".to_string(),
            country: Country::Canada,
            currency: "CAD".to_string(),
            account: Some("TFSA".to_string()),
            kind,
            quantity: dec(qty),
            price: dec(price),
            fees: Decimal::ZERO,
            name: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn opening_position_becomes_a_buy() -> Result<()> {
        let ledger = ledger();
        let holding = ledger
            .create_holding(
                NewHolding::new("XEQT", "TSX", Country::Canada, "CAD")
                    .with_account("TFSA")
                    .with_position(dec(100), dec(30), day(1, 1)),
            )
            .await?;
        assert_eq!(holding.quantity, dec(100));
        assert_eq!(holding.avg_cost, dec(30));
        assert!(holding.is_active);
        assert_eq!(holding.first_purchase_date, Some(day(1, 1)));

        let err = ledger
            .create_holding(NewHolding::new("xeqt", "TSX", Country::Canada, "CAD").with_account("tfsa"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LedgerError>(),
            Some(LedgerError::DuplicateHolding { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn selling_everything_deactivates() -> Result<()> {
        let ledger = ledger();
        let holding = ledger
            .create_holding(
                NewHolding::new("VFV", "TSX", Country::Canada, "CAD")
                    .with_position(dec(10), dec(100), day(1, 2)),
            )
            .await?;
        ledger
            .record(&holding.id, TransactionKind::Sell, dec(10), dec(110), Decimal::ZERO, day(3, 1))
            .await?;

        let holding = ledger.storage().get_holding(&holding.id).await?.unwrap();
        assert!(!holding.is_active);
        assert_eq!(holding.quantity, Decimal::ZERO);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_transactions_are_rejected() -> Result<()> {
        let ledger = ledger();
        let holding = ledger
            .create_holding(NewHolding::new("VFV", "TSX", Country::Canada, "CAD"))
            .await?;
        let err = ledger
            .record(&holding.id, TransactionKind::Buy, Decimal::ZERO, dec(10), Decimal::ZERO, day(3, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LedgerError>(),
            Some(LedgerError::InvalidTransaction(TransactionError::NonPositiveQuantity(_)))
        ));

        let missing = ledger
            .record(&Id::new(), TransactionKind::Buy, dec(1), dec(10), Decimal::ZERO, day(3, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            missing.downcast_ref::<LedgerError>(),
            Some(LedgerError::HoldingNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn import_skips_duplicates_and_groups_by_position() -> Result<()> {
        let ledger = ledger();
        let records = vec![
            record(day(2, 1), "VFV", TransactionKind::Buy, 5, 100),
            record(day(1, 1), "XEQT", TransactionKind::Buy, 10, 30),
            record(day(1, 1), "XEQT", TransactionKind::Buy, 10, 30),
            record(day(3, 1), "XEQT", TransactionKind::Sell, 4, 32),
        ];

        let preview = ledger.preview_import(&records).await?;
        assert_eq!(preview.new_symbols, vec!["VFV", "XEQT"]);
        assert_eq!(preview.first_date, Some(day(1, 1)));

        let report = ledger.import(records.clone()).await?;
        assert_eq!(report.imported, 3);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.holdings_created, 2);

        let again = ledger.import(records).await?;
        assert_eq!(again.imported, 0);
        assert_eq!(again.duplicates, 4);

        let holdings = ledger.storage().list_holdings().await?;
        let xeqt = holdings.iter().find(|h| h.symbol == "XEQT").unwrap();
        assert_eq!(xeqt.quantity, dec(6));
        assert_eq!(xeqt.first_purchase_date, Some(day(1, 1)));
        Ok(())
    }

    #[tokio::test]
    async fn import_with_no_valid_records_fails() {
        let ledger = ledger();
        let err = ledger
            .import(vec![record(day(1, 1), "XEQT", TransactionKind::Buy, 0, 30)])
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LedgerError>(),
            Some(LedgerError::NothingToImport)
        ));
    }
}
