mod support;

use std::sync::Arc;

use anyhow::Result;
use holdbook::models::{Country, DateRange, ManualValuation};
use holdbook::portfolio::{ImportRecord, Ledger, LedgerError};
use holdbook::storage::{HoldingFilter, JsonFileStorage, Storage};
use support::{date, dec};
use tempfile::TempDir;

const EXPORT: &str = r#"[
    {"date": "2024-01-02", "symbol": "XEQT", "exchange": "TSX", "country": "CA",
     "currency": "CAD", "account": "TFSA", "kind": "BUY", "quantity": "100",
     "price": "30", "fees": "5", "name": "iShares Core Equity"},
    {"date": "2024-02-01", "symbol": "XEQT", "exchange": "TSX", "country": "CA",
     "currency": "CAD", "account": "TFSA", "kind": "SELL", "quantity": "40",
     "price": "32"},
    {"date": "2024-01-15", "symbol": "AAPL", "exchange": "NASDAQ", "country": "US",
     "currency": "USD", "kind": "BUY", "quantity": "10", "price": "185.5"},
    {"date": "2024-01-16", "symbol": "AAPL", "exchange": "NASDAQ", "country": "US",
     "currency": "USD", "kind": "BUY", "quantity": "0", "price": "185.5"}
]"#;

fn records() -> Vec<ImportRecord> {
    serde_json::from_str(EXPORT).unwrap()
}

fn ledger(dir: &TempDir) -> Ledger {
    Ledger::new(Arc::new(JsonFileStorage::new(dir.path())))
}

#[tokio::test]
async fn import_persists_holdings_and_ledgers() -> Result<()> {
    let dir = TempDir::new()?;
    let report = ledger(&dir).import(records()).await?;
    assert_eq!(report.imported, 3);
    assert_eq!(report.holdings_created, 2);
    assert_eq!(report.duplicates, 0);
    assert_eq!(report.errors.len(), 1, "zero quantity row is rejected");

    // A fresh handle on the same directory sees everything.
    let storage = JsonFileStorage::new(dir.path());
    let holdings = storage.list_active_holdings(&HoldingFilter::all()).await?;
    let symbols: Vec<&str> = holdings.iter().map(|h| h.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["AAPL", "XEQT"]);

    let xeqt = &holdings[1];
    assert_eq!(xeqt.account.as_deref(), Some("TFSA"));
    assert_eq!(xeqt.quantity, dec("60"));
    assert_eq!(xeqt.avg_cost, dec("30.05"));
    assert_eq!(xeqt.first_purchase_date, Some(date(2024, 1, 2)));
    assert_eq!(xeqt.name.as_deref(), Some("iShares Core Equity"));
    assert_eq!(storage.get_transactions(&xeqt.id).await?.len(), 2);

    let aapl = &holdings[0];
    assert_eq!(aapl.country, Country::UnitedStates);
    assert_eq!(aapl.account_key(), "UNASSIGNED");
    Ok(())
}

#[tokio::test]
async fn reimporting_the_same_export_adds_nothing() -> Result<()> {
    let dir = TempDir::new()?;
    ledger(&dir).import(records()).await?;

    let preview = ledger(&dir).preview_import(&records()).await?;
    assert_eq!(preview.records, 4);
    assert_eq!(preview.potential_duplicates, 3);
    assert_eq!(preview.existing_symbols, vec!["AAPL", "XEQT"]);
    assert!(preview.new_symbols.is_empty());
    assert_eq!(preview.first_date, Some(date(2024, 1, 2)));
    assert_eq!(preview.last_date, Some(date(2024, 2, 1)));

    let report = ledger(&dir).import(records()).await?;
    assert_eq!(report.imported, 0);
    assert_eq!(report.duplicates, 3);
    assert_eq!(report.holdings_created, 0);

    let storage = JsonFileStorage::new(dir.path());
    assert_eq!(storage.all_transactions().await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn import_with_no_valid_rows_fails() -> Result<()> {
    let dir = TempDir::new()?;
    let bad: Vec<ImportRecord> = records().into_iter().skip(3).collect();
    let err = ledger(&dir).import(bad).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::NothingToImport)
    ));
    Ok(())
}

#[tokio::test]
async fn rebuild_all_restores_positions_from_disk() -> Result<()> {
    let dir = TempDir::new()?;
    ledger(&dir).import(records()).await?;

    // Corrupt the stored projection; the ledger is the source of truth.
    let storage = JsonFileStorage::new(dir.path());
    let mut holdings = storage.list_holdings().await?;
    for holding in &mut holdings {
        holding.quantity = dec("999");
        storage.save_holding(holding).await?;
    }

    assert_eq!(ledger(&dir).rebuild_all().await?, 2);
    let rebuilt = storage.list_active_holdings(&HoldingFilter::all()).await?;
    let quantities: Vec<_> = rebuilt.iter().map(|h| h.quantity).collect();
    assert_eq!(quantities, vec![dec("10"), dec("60")]);
    Ok(())
}

#[tokio::test]
async fn snapshots_and_valuations_survive_reload() -> Result<()> {
    let dir = TempDir::new()?;
    ledger(&dir).import(records()).await?;
    let storage = Arc::new(JsonFileStorage::new(dir.path()));
    let xeqt = storage
        .list_active_holdings(&HoldingFilter {
            account: Some("tfsa".to_string()),
            ..HoldingFilter::default()
        })
        .await?
        .remove(0);

    storage
        .save_manual_valuation(&ManualValuation::new(&xeqt, date(2024, 1, 31), dec("3125")))
        .await?;

    let h = support::Harness::with_storage(
        storage.clone(),
        date(2024, 6, 3),
        support::MockPrices::new(),
        support::MockRates::new(),
    );
    h.snapshots().create_snapshot(date(2024, 1, 31)).await?;

    let reloaded = JsonFileStorage::new(dir.path());
    let valuation = reloaded
        .manual_valuation_on_or_before(&xeqt.id, date(2024, 2, 20))
        .await?
        .unwrap();
    assert_eq!(valuation.value, dec("3125"));

    let snapshots = reloaded.list_snapshots(&DateRange::all()).await?;
    assert_eq!(snapshots.len(), 1);
    // AAPL has no price on that date and is left out.
    assert_eq!(snapshots[0].total_value, dec("3125"));
    Ok(())
}
