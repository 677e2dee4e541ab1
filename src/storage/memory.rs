//! In-memory storage, used by tests and dry runs.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use chrono::NaiveDate;
use tokio::sync::Mutex;

use crate::models::{DateRange, Holding, Id, ManualValuation, PortfolioSnapshot, Transaction};

use super::{SnapshotConflict, Storage};

#[derive(Default)]
pub struct MemoryStorage {
    holdings: Mutex<HashMap<Id, Holding>>,
    transactions: Mutex<HashMap<Id, Vec<Transaction>>>,
    snapshots: Mutex<BTreeMap<NaiveDate, PortfolioSnapshot>>,
    valuations: Mutex<HashMap<Id, Vec<ManualValuation>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn list_holdings(&self) -> Result<Vec<Holding>> {
        let holdings = self.holdings.lock().await;
        Ok(holdings.values().cloned().collect())
    }

    async fn get_holding(&self, id: &Id) -> Result<Option<Holding>> {
        let holdings = self.holdings.lock().await;
        Ok(holdings.get(id).cloned())
    }

    async fn save_holding(&self, holding: &Holding) -> Result<()> {
        let mut holdings = self.holdings.lock().await;
        holdings.insert(holding.id.clone(), holding.clone());
        Ok(())
    }

    async fn get_transactions(&self, holding_id: &Id) -> Result<Vec<Transaction>> {
        let transactions = self.transactions.lock().await;
        Ok(transactions.get(holding_id).cloned().unwrap_or_default())
    }

    async fn append_transactions(&self, holding_id: &Id, txns: &[Transaction]) -> Result<()> {
        let mut transactions = self.transactions.lock().await;
        transactions
            .entry(holding_id.clone())
            .or_default()
            .extend_from_slice(txns);
        Ok(())
    }

    async fn get_snapshot(&self, date: NaiveDate) -> Result<Option<PortfolioSnapshot>> {
        Ok(self.snapshots.lock().await.get(&date).cloned())
    }

    async fn insert_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        let mut snapshots = self.snapshots.lock().await;
        if snapshots.contains_key(&snapshot.date) {
            return Err(SnapshotConflict {
                date: snapshot.date,
            }
            .into());
        }
        snapshots.insert(snapshot.date, snapshot.clone());
        Ok(())
    }

    async fn update_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<bool> {
        let mut snapshots = self.snapshots.lock().await;
        match snapshots.get_mut(&snapshot.date) {
            Some(existing) => {
                *existing = snapshot.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_snapshots(&self, range: &DateRange) -> Result<Vec<PortfolioSnapshot>> {
        let snapshots = self.snapshots.lock().await;
        Ok(snapshots
            .values()
            .filter(|s| range.contains(s.date))
            .cloned()
            .collect())
    }

    async fn delete_snapshots(&self, range: &DateRange) -> Result<usize> {
        let mut snapshots = self.snapshots.lock().await;
        let before = snapshots.len();
        snapshots.retain(|date, _| !range.contains(*date));
        Ok(before - snapshots.len())
    }

    async fn save_manual_valuation(&self, valuation: &ManualValuation) -> Result<()> {
        let mut valuations = self.valuations.lock().await;
        let entries = valuations.entry(valuation.holding_id.clone()).or_default();
        entries.retain(|v| v.date != valuation.date);
        entries.push(valuation.clone());
        Ok(())
    }

    async fn manual_valuation_on_or_before(
        &self,
        holding_id: &Id,
        date: NaiveDate,
    ) -> Result<Option<ManualValuation>> {
        let valuations = self.valuations.lock().await;
        Ok(valuations
            .get(holding_id)
            .and_then(|entries| {
                entries
                    .iter()
                    .filter(|v| v.date <= date)
                    .max_by_key(|v| v.date)
            })
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Country;
    use crate::storage::{HoldingFilter, UpsertOutcome};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
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
            value_by_country: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_existing_date() -> Result<()> {
        let storage = MemoryStorage::new();
        assert_eq!(storage.upsert_snapshot(&snapshot(day(2), 110)).await?, UpsertOutcome::Created);
        assert_eq!(storage.upsert_snapshot(&snapshot(day(2), 120)).await?, UpsertOutcome::Updated);

        let all = storage.list_snapshots(&DateRange::all()).await?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].total_value, Decimal::from(120));
        Ok(())
    }

    #[tokio::test]
    async fn insert_conflict_is_typed() -> Result<()> {
        let storage = MemoryStorage::new();
        storage.insert_snapshot(&snapshot(day(2), 110)).await?;
        let err = storage.insert_snapshot(&snapshot(day(2), 110)).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<SnapshotConflict>(),
            Some(&SnapshotConflict { date: day(2) })
        );
        Ok(())
    }

    #[tokio::test]
    async fn latest_before_and_delete_use_ranges() -> Result<()> {
        let storage = MemoryStorage::new();
        for d in [2, 3, 8] {
            storage.insert_snapshot(&snapshot(day(d), 100)).await?;
        }
        let previous = storage.latest_snapshot_before(day(8)).await?.unwrap();
        assert_eq!(previous.date, day(3));
        assert!(storage.latest_snapshot_before(day(2)).await?.is_none());

        assert_eq!(storage.delete_snapshots(&DateRange::between(day(3), day(8))).await?, 2);
        assert_eq!(storage.list_snapshots(&DateRange::all()).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn transactions_come_back_in_ledger_order() -> Result<()> {
        let storage = MemoryStorage::new();
        let id = Id::new();
        let later = Transaction::buy(id.clone(), "VFV", Decimal::ONE, Decimal::TEN, day(9));
        let first = Transaction::buy(id.clone(), "VFV", Decimal::TWO, Decimal::TEN, day(4));
        let same_day = Transaction::sell(id.clone(), "VFV", Decimal::ONE, Decimal::TEN, day(4));
        storage
            .append_transactions(&id, &[later.clone(), first.clone(), same_day.clone()])
            .await?;

        let txns = storage.transactions_for(&id, &DateRange::all()).await?;
        let ids: Vec<&Id> = txns.iter().map(|t| &t.id).collect();
        assert_eq!(ids, vec![&first.id, &same_day.id, &later.id]);

        let upto = storage.transactions_for(&id, &DateRange::up_to(day(5))).await?;
        assert_eq!(upto.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn active_holdings_are_filtered_and_sorted() -> Result<()> {
        let storage = MemoryStorage::new();
        let xeqt = Holding::new("XEQT", "TSX", Country::Canada, "CAD")
            .with_account("TFSA")
            .with_position(Decimal::TEN, Decimal::TEN);
        let aapl = Holding::new("AAPL", "NASDAQ", Country::UnitedStates, "USD")
            .with_position(Decimal::ONE, Decimal::TEN);
        let closed = Holding::new("VFV", "TSX", Country::Canada, "CAD");
        let closed = Holding {
            is_active: false,
            ..closed
        };
        for h in [&xeqt, &aapl, &closed] {
            storage.save_holding(h).await?;
        }

        let all = storage.list_active_holdings(&HoldingFilter::all()).await?;
        let symbols: Vec<&str> = all.iter().map(|h| h.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AAPL", "XEQT"]);

        let canada = HoldingFilter {
            country: Some(Country::Canada),
            ..HoldingFilter::default()
        };
        assert_eq!(storage.list_active_holdings(&canada).await?.len(), 1);

        let unassigned = HoldingFilter {
            account: Some("unassigned".to_string()),
            ..HoldingFilter::default()
        };
        let found = storage.list_active_holdings(&unassigned).await?;
        assert_eq!(found[0].symbol, "AAPL");
        Ok(())
    }

    #[tokio::test]
    async fn valuation_lookup_takes_latest_not_after_date() -> Result<()> {
        let storage = MemoryStorage::new();
        let fund = Holding::new("PPFAS", "AMFI", Country::India, "INR");
        for (d, v) in [(2, 1000), (10, 1100)] {
            storage
                .save_manual_valuation(&ManualValuation::new(&fund, day(d), Decimal::from(v)))
                .await?;
        }
        let found = storage.manual_valuation_on_or_before(&fund.id, day(9)).await?;
        assert_eq!(found.map(|v| v.value), Some(Decimal::from(1000)));
        assert!(storage.manual_valuation_on_or_before(&fund.id, day(1)).await?.is_none());
        Ok(())
    }
}
