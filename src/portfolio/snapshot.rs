//! Daily whole-portfolio valuations and their backfill.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::reconstruct::state_at;
use crate::clock::{days_inclusive, is_business_day, Clock, SystemClock};
use crate::currency::CurrencyService;
use crate::market_data::PriceService;
use crate::models::{gain_pct, Country, DateRange, Holding, ManualValuation, PortfolioSnapshot};
use crate::storage::{HoldingFilter, Storage, UpsertOutcome};

pub const DEFAULT_GAP_THRESHOLD_DAYS: i64 = 5;

/// Where a holding's value on a date came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValuationSource {
    Market,
    Manual,
    ConstantValue,
}

/// One holding's contribution to a snapshot, in the base currency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HoldingValuation {
    pub symbol: String,
    pub account: String,
    pub country: Country,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub value: Decimal,
    pub cost: Decimal,
    pub source: ValuationSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Valuation {
    pub snapshot: PortfolioSnapshot,
    pub holdings: Vec<HoldingValuation>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotOutcome {
    pub date: NaiveDate,
    pub outcome: UpsertOutcome,
    pub snapshot: PortfolioSnapshot,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackfillReport {
    pub created: usize,
    pub skipped_existing: usize,
    pub skipped_weekends: usize,
    pub failed: Vec<NaiveDate>,
    pub warnings: Vec<String>,
}

/// Two consecutive snapshots further apart than the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SnapshotGap {
    pub after: NaiveDate,
    pub before: NaiveDate,
    pub days: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotChange {
    pub date: NaiveDate,
    pub previous_date: NaiveDate,
    pub change: Decimal,
    pub change_pct: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioHistory {
    pub snapshots: Vec<PortfolioSnapshot>,
    pub current_value: Option<Decimal>,
    pub change: Decimal,
    pub change_pct: Decimal,
}

/// Values the portfolio on a date and keeps the per-date snapshot series.
///
/// Today is valued from the holdings' current position fields. Any other
/// date replays the ledger up to that date and uses the closing price for
/// it.
pub struct SnapshotEngine {
    storage: Arc<dyn Storage>,
    prices: Arc<PriceService>,
    currency: Arc<CurrencyService>,
    base_currency: String,
    gap_threshold_days: i64,
    clock: Arc<dyn Clock>,
}

impl SnapshotEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        prices: Arc<PriceService>,
        currency: Arc<CurrencyService>,
        base_currency: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            prices,
            currency,
            base_currency: base_currency.into().trim().to_uppercase(),
            gap_threshold_days: DEFAULT_GAP_THRESHOLD_DAYS,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_gap_threshold(mut self, days: i64) -> Self {
        self.gap_threshold_days = days;
        self
    }

    pub fn base_currency(&self) -> &str {
        &self.base_currency
    }

    /// Compute the valuation for `date` without persisting it.
    pub async fn value_on(&self, date: NaiveDate) -> Result<Valuation> {
        let is_today = date == self.clock.today();
        let holdings = self.storage.list_active_holdings(&HoldingFilter::all()).await?;

        let mut total_value = Decimal::ZERO;
        let mut total_cost = Decimal::ZERO;
        let mut by_country: BTreeMap<Country, Decimal> = BTreeMap::new();
        let mut valued = Vec::new();
        let mut warnings = Vec::new();

        for holding in holdings.iter().filter(|h| h.is_held_on(date)) {
            let Some(entry) = self
                .value_holding(holding, date, is_today, &mut warnings)
                .await?
            else {
                continue;
            };

            let value = self
                .currency
                .convert_or_original(entry.value, &holding.currency, &self.base_currency, date)
                .await;
            let cost = self
                .currency
                .convert_or_original(entry.cost, &holding.currency, &self.base_currency, date)
                .await;
            if let Some(warning) = value.warning {
                warnings.push(format!("{}: {warning}", holding.symbol));
            }

            total_value += value.amount;
            total_cost += cost.amount;
            *by_country.entry(holding.country).or_default() += value.amount;
            valued.push(HoldingValuation {
                value: value.amount,
                cost: cost.amount,
                ..entry
            });
        }

        let unrealized_gain = total_value - total_cost;
        let now = Utc::now();
        let snapshot = PortfolioSnapshot {
            date,
            currency: self.base_currency.clone(),
            total_value,
            total_cost,
            unrealized_gain,
            unrealized_gain_pct: gain_pct(unrealized_gain, total_cost),
            holdings_count: valued.len(),
            value_by_country: by_country,
            created_at: now,
            updated_at: now,
        };
        Ok(Valuation {
            snapshot,
            holdings: valued,
            warnings,
        })
    }

    /// Value in the holding's own currency, or `None` when it is skipped.
    async fn value_holding(
        &self,
        holding: &Holding,
        date: NaiveDate,
        is_today: bool,
        warnings: &mut Vec<String>,
    ) -> Result<Option<HoldingValuation>> {
        let entry = |quantity: Decimal,
                     price: Option<Decimal>,
                     value: Decimal,
                     cost: Decimal,
                     source: ValuationSource| HoldingValuation {
            symbol: holding.symbol.clone(),
            account: holding.account_key().to_string(),
            country: holding.country,
            quantity,
            price,
            value,
            cost,
            source,
        };

        if holding.is_constant_value() {
            // Holdings saved without a ledger keep their current cost.
            let has_ledger = !self.storage.get_transactions(&holding.id).await?.is_empty();
            let (quantity, cost) = if is_today || !has_ledger {
                (holding.quantity, holding.cost_basis())
            } else {
                let state = state_at(self.storage.as_ref(), holding, date).await?;
                warnings.extend(state.warnings);
                (state.quantity, state.cost_basis)
            };
            if cost.is_zero() {
                return Ok(None);
            }
            return Ok(Some(entry(
                quantity,
                None,
                cost,
                cost,
                ValuationSource::ConstantValue,
            )));
        }

        let (quantity, cost) = if is_today {
            (holding.quantity, holding.cost_basis())
        } else {
            let state = state_at(self.storage.as_ref(), holding, date).await?;
            warnings.extend(state.warnings);
            (state.quantity, state.cost_basis)
        };
        if quantity.is_zero() {
            return Ok(None);
        }

        let price = match self.prices.historical_price(&holding.instrument(), date).await {
            Ok(price) => price,
            Err(e) => {
                warn!(symbol = %holding.symbol, date = %date, error = %e, "price lookup failed");
                None
            }
        };
        if let Some(price) = price {
            return Ok(Some(entry(
                quantity,
                Some(price),
                quantity * price,
                cost,
                ValuationSource::Market,
            )));
        }

        let manual = match self
            .storage
            .manual_valuation_on_or_before(&holding.id, date)
            .await?
        {
            Some(valuation) => Some(valuation),
            None => ManualValuation::from_legacy_note(holding, date),
        };
        if let Some(valuation) = manual {
            debug!(symbol = %holding.symbol, date = %date, value = %valuation.value, "using manual valuation");
            return Ok(Some(entry(
                quantity,
                None,
                valuation.value,
                cost,
                ValuationSource::Manual,
            )));
        }

        warn!(symbol = %holding.symbol, date = %date, "no price, holding left out of snapshot");
        warnings.push(format!("{}: no price for {date}; excluded", holding.symbol));
        Ok(None)
    }

    /// Value `date` and write it, replacing any snapshot already stored for it.
    pub async fn create_snapshot(&self, date: NaiveDate) -> Result<SnapshotOutcome> {
        let valuation = self.value_on(date).await?;
        let outcome = self.storage.upsert_snapshot(&valuation.snapshot).await?;
        info!(
            date = %date,
            value = %valuation.snapshot.total_value,
            holdings = valuation.snapshot.holdings_count,
            outcome = ?outcome,
            "snapshot saved"
        );
        Ok(SnapshotOutcome {
            date,
            outcome,
            snapshot: valuation.snapshot,
            warnings: valuation.warnings,
        })
    }

    /// Create a snapshot for every weekday in `[start, end]` that has none.
    /// A failing day is logged and skipped.
    pub async fn backfill(&self, start: NaiveDate, end: NaiveDate) -> Result<BackfillReport> {
        let mut report = BackfillReport::default();
        let existing: Vec<NaiveDate> = self
            .storage
            .list_snapshots(&DateRange::between(start, end))
            .await?
            .into_iter()
            .map(|s| s.date)
            .collect();

        for date in days_inclusive(start, end) {
            if !is_business_day(date) {
                report.skipped_weekends += 1;
                continue;
            }
            if existing.contains(&date) {
                report.skipped_existing += 1;
                continue;
            }
            match self.create_snapshot(date).await {
                Ok(outcome) => {
                    report.created += 1;
                    report
                        .warnings
                        .extend(outcome.warnings.into_iter().map(|w| format!("{date}: {w}")));
                }
                Err(e) => {
                    error!(date = %date, error = %e, "snapshot failed");
                    report.failed.push(date);
                }
            }
        }

        info!(
            start = %start,
            end = %end,
            created = report.created,
            existing = report.skipped_existing,
            failed = report.failed.len(),
            "snapshot backfill finished"
        );
        Ok(report)
    }

    /// Gaps in the stored series over `range`.
    pub async fn gaps(&self, range: &DateRange) -> Result<Vec<SnapshotGap>> {
        let dates: Vec<NaiveDate> = self
            .storage
            .list_snapshots(range)
            .await?
            .into_iter()
            .map(|s| s.date)
            .collect();
        Ok(find_gaps(&dates, self.gap_threshold_days))
    }

    /// Change of the snapshot on `date` against the latest earlier one.
    pub async fn change_from_previous(&self, date: NaiveDate) -> Result<Option<SnapshotChange>> {
        let Some(current) = self.storage.get_snapshot(date).await? else {
            return Ok(None);
        };
        let Some(previous) = self.storage.latest_snapshot_before(date).await? else {
            return Ok(None);
        };
        let change = current.total_value - previous.total_value;
        Ok(Some(SnapshotChange {
            date,
            previous_date: previous.date,
            change,
            change_pct: gain_pct(change, previous.total_value),
        }))
    }

    /// Snapshots over the last `days` days, with the change from the first
    /// of them to `current_value` (or to the last snapshot).
    pub async fn history(&self, days: i64, current_value: Option<Decimal>) -> Result<PortfolioHistory> {
        let today = self.clock.today();
        let start = today - Duration::days(days.max(0));
        let snapshots = self
            .storage
            .list_snapshots(&DateRange::between(start, today))
            .await?;

        let end_value = current_value.or_else(|| snapshots.last().map(|s| s.total_value));
        let (change, change_pct) = match (snapshots.first(), end_value) {
            (Some(first), Some(end)) => {
                let change = end - first.total_value;
                (change, gain_pct(change, first.total_value))
            }
            _ => (Decimal::ZERO, Decimal::ZERO),
        };
        Ok(PortfolioHistory {
            snapshots,
            current_value,
            change,
            change_pct,
        })
    }
}

/// Consecutive dates (ascending) more than `threshold_days` apart.
pub fn find_gaps(dates: &[NaiveDate], threshold_days: i64) -> Vec<SnapshotGap> {
    dates
        .windows(2)
        .filter_map(|pair| {
            let days = (pair[1] - pair[0]).num_days();
            (days > threshold_days).then_some(SnapshotGap {
                after: pair[0],
                before: pair[1],
                days,
            })
        })
        .collect()
}
