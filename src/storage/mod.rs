mod json_file;
mod memory;

pub use json_file::JsonFileStorage;
pub use memory::MemoryStorage;

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;

use crate::models::{
    sort_ledger, Country, DateRange, Holding, Id, ManualValuation, PortfolioSnapshot, Transaction,
};

/// Insert refused because a snapshot for the date already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("a snapshot for {date} already exists")]
pub struct SnapshotConflict {
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Narrows the active holdings an operation works on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoldingFilter {
    pub country: Option<Country>,
    pub exchange: Option<String>,
    pub account: Option<String>,
}

impl HoldingFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, holding: &Holding) -> bool {
        self.country.is_none_or(|c| holding.country == c)
            && self
                .exchange
                .as_deref()
                .is_none_or(|e| holding.exchange.eq_ignore_ascii_case(e))
            && self
                .account
                .as_deref()
                .is_none_or(|a| holding.account_key().eq_ignore_ascii_case(a))
    }
}

/// Persistence for holdings, their ledgers, snapshots and manual valuations.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    // Holdings
    async fn list_holdings(&self) -> Result<Vec<Holding>>;
    async fn get_holding(&self, id: &Id) -> Result<Option<Holding>>;
    async fn save_holding(&self, holding: &Holding) -> Result<()>;

    /// Active holdings matching `filter`, ordered by symbol.
    async fn list_active_holdings(&self, filter: &HoldingFilter) -> Result<Vec<Holding>> {
        let mut holdings: Vec<Holding> = self
            .list_holdings()
            .await?
            .into_iter()
            .filter(|h| h.is_active && filter.matches(h))
            .collect();
        holdings.sort_by(|a, b| a.symbol.cmp(&b.symbol).then_with(|| a.account.cmp(&b.account)));
        Ok(holdings)
    }

    // Transactions, kept in insertion order
    async fn get_transactions(&self, holding_id: &Id) -> Result<Vec<Transaction>>;
    async fn append_transactions(&self, holding_id: &Id, txns: &[Transaction]) -> Result<()>;

    /// A holding's transactions within `range`, in ledger order.
    async fn transactions_for(&self, holding_id: &Id, range: &DateRange) -> Result<Vec<Transaction>> {
        let mut txns: Vec<Transaction> = self
            .get_transactions(holding_id)
            .await?
            .into_iter()
            .filter(|t| range.contains(t.date))
            .collect();
        sort_ledger(&mut txns);
        Ok(txns)
    }

    async fn all_transactions(&self) -> Result<Vec<Transaction>> {
        let mut all = Vec::new();
        for holding in self.list_holdings().await? {
            all.extend(self.get_transactions(&holding.id).await?);
        }
        sort_ledger(&mut all);
        Ok(all)
    }

    // Snapshots, unique on date
    async fn get_snapshot(&self, date: NaiveDate) -> Result<Option<PortfolioSnapshot>>;

    /// Fails with [`SnapshotConflict`] when the date is taken.
    async fn insert_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()>;

    /// Returns false when there is no snapshot for the date.
    async fn update_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<bool>;

    /// Snapshots within `range`, ascending by date.
    async fn list_snapshots(&self, range: &DateRange) -> Result<Vec<PortfolioSnapshot>>;

    async fn delete_snapshots(&self, range: &DateRange) -> Result<usize>;

    async fn latest_snapshot_before(&self, date: NaiveDate) -> Result<Option<PortfolioSnapshot>> {
        let Some(previous_day) = date.pred_opt() else {
            return Ok(None);
        };
        Ok(self
            .list_snapshots(&DateRange::up_to(previous_day))
            .await?
            .pop())
    }

    /// Insert, or overwrite the existing snapshot for the date. An insert
    /// that loses a race to another writer is retried as an update.
    async fn upsert_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<UpsertOutcome> {
        if let Some(mut existing) = self.get_snapshot(snapshot.date).await? {
            existing.refresh_from(snapshot);
            self.update_snapshot(&existing).await?;
            return Ok(UpsertOutcome::Updated);
        }

        match self.insert_snapshot(snapshot).await {
            Ok(()) => Ok(UpsertOutcome::Created),
            Err(e) if e.downcast_ref::<SnapshotConflict>().is_some() => {
                debug!(date = %snapshot.date, "snapshot inserted concurrently, updating instead");
                let mut existing = self
                    .get_snapshot(snapshot.date)
                    .await?
                    .unwrap_or_else(|| snapshot.clone());
                existing.refresh_from(snapshot);
                if self.update_snapshot(&existing).await? {
                    Ok(UpsertOutcome::Updated)
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    // Manual valuations
    async fn save_manual_valuation(&self, valuation: &ManualValuation) -> Result<()>;

    /// Most recent valuation dated on or before `date`.
    async fn manual_valuation_on_or_before(
        &self,
        holding_id: &Id,
        date: NaiveDate,
    ) -> Result<Option<ManualValuation>>;
}
