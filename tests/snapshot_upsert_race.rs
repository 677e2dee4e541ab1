use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use holdbook::models::{
    DateRange, Holding, Id, ManualValuation, PortfolioSnapshot, Transaction,
};
use holdbook::storage::{MemoryStorage, SnapshotConflict, Storage, UpsertOutcome};
use rust_decimal::Decimal;

/// Hides existing snapshots from the first lookup, as if another writer
/// inserted the row between our read and our insert.
struct RacyStorage {
    inner: MemoryStorage,
    hide_next_lookup: AtomicBool,
}

#[async_trait]
impl Storage for RacyStorage {
    async fn list_holdings(&self) -> Result<Vec<Holding>> {
        self.inner.list_holdings().await
    }

    async fn get_holding(&self, id: &Id) -> Result<Option<Holding>> {
        self.inner.get_holding(id).await
    }

    async fn save_holding(&self, holding: &Holding) -> Result<()> {
        self.inner.save_holding(holding).await
    }

    async fn get_transactions(&self, holding_id: &Id) -> Result<Vec<Transaction>> {
        self.inner.get_transactions(holding_id).await
    }

    async fn append_transactions(&self, holding_id: &Id, txns: &[Transaction]) -> Result<()> {
        self.inner.append_transactions(holding_id, txns).await
    }

    async fn get_snapshot(&self, date: NaiveDate) -> Result<Option<PortfolioSnapshot>> {
        if self.hide_next_lookup.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.get_snapshot(date).await
    }

    async fn insert_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        self.inner.insert_snapshot(snapshot).await
    }

    async fn update_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<bool> {
        self.inner.update_snapshot(snapshot).await
    }

    async fn list_snapshots(&self, range: &DateRange) -> Result<Vec<PortfolioSnapshot>> {
        self.inner.list_snapshots(range).await
    }

    async fn delete_snapshots(&self, range: &DateRange) -> Result<usize> {
        self.inner.delete_snapshots(range).await
    }

    async fn save_manual_valuation(&self, valuation: &ManualValuation) -> Result<()> {
        self.inner.save_manual_valuation(valuation).await
    }

    async fn manual_valuation_on_or_before(
        &self,
        holding_id: &Id,
        date: NaiveDate,
    ) -> Result<Option<ManualValuation>> {
        self.inner.manual_valuation_on_or_before(holding_id, date).await
    }
}

fn snapshot(date: NaiveDate, value: i64) -> PortfolioSnapshot {
    let now = Utc::now();
    PortfolioSnapshot {
        date,
        currency: "CAD".to_string(),
        total_value: Decimal::from(value),
        total_cost: Decimal::from(100),
        unrealized_gain: Decimal::from(value - 100),
        unrealized_gain_pct: Decimal::ZERO,
        holdings_count: 1,
        value_by_country: Default::default(),
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn lost_insert_race_becomes_an_update() -> Result<()> {
    let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
    let storage = Arc::new(RacyStorage {
        inner: MemoryStorage::new(),
        hide_next_lookup: AtomicBool::new(false),
    });
    let first = snapshot(date, 100);
    storage.insert_snapshot(&first).await?;

    let err = storage.insert_snapshot(&snapshot(date, 150)).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<SnapshotConflict>(),
        Some(&SnapshotConflict { date })
    );

    storage.hide_next_lookup.store(true, Ordering::SeqCst);
    let outcome = storage.upsert_snapshot(&snapshot(date, 200)).await?;
    assert_eq!(outcome, UpsertOutcome::Updated);

    let stored = storage.get_snapshot(date).await?.unwrap();
    assert_eq!(stored.total_value, Decimal::from(200));
    assert_eq!(stored.created_at, first.created_at);
    assert_eq!(storage.list_snapshots(&DateRange::all()).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn upsert_then_delete_range() -> Result<()> {
    let storage = MemoryStorage::new();
    for day in 1..=5 {
        let date = NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        assert_eq!(
            storage.upsert_snapshot(&snapshot(date, 100 + i64::from(day))).await?,
            UpsertOutcome::Created
        );
    }

    let start = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
    let end = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
    assert_eq!(storage.delete_snapshots(&DateRange::between(start, end)).await?, 2);

    let before = storage
        .latest_snapshot_before(NaiveDate::from_ymd_opt(2024, 1, 4).unwrap())
        .await?
        .unwrap();
    assert_eq!(before.date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    Ok(())
}
