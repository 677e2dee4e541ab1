//! Realized gains with first-in, first-out lot matching.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use crate::currency::CurrencyService;
use crate::models::{DateRange, Holding, Id, Transaction, TransactionKind};
use crate::storage::{HoldingFilter, Storage};

/// Same-day SELL/BUY pairs closer than this in quantity are treated as a transfer.
pub const ROUND_TRIP_QUANTITY_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 4);
/// ...and closer than this in price.
pub const ROUND_TRIP_PRICE_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// An open purchase lot. `fees` shrink in proportion when the lot is partly sold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lot {
    pub date: NaiveDate,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fees: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumedLot {
    pub date: NaiveDate,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fees: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Consumption {
    pub lots: Vec<ConsumedLot>,
    pub cost_basis: Decimal,
    pub matched: Decimal,
    pub unmatched: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct LotQueue {
    lots: VecDeque<Lot>,
}

impl LotQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, lot: Lot) {
        self.lots.push_back(lot);
    }

    pub fn lots(&self) -> impl Iterator<Item = &Lot> {
        self.lots.iter()
    }

    pub fn total_quantity(&self) -> Decimal {
        self.lots.iter().map(|l| l.quantity).sum()
    }

    /// Take `quantity` from the oldest lots. Whatever the queue cannot cover
    /// is reported as `unmatched` and adds nothing to the cost basis.
    pub fn consume(&mut self, quantity: Decimal) -> Consumption {
        let mut consumption = Consumption::default();
        let mut remaining = quantity;

        while remaining > Decimal::ZERO {
            let Some(front) = self.lots.front_mut() else {
                break;
            };

            if front.quantity <= remaining {
                let lot = front.clone();
                self.lots.pop_front();
                remaining -= lot.quantity;
                consumption.cost_basis += lot.quantity * lot.price + lot.fees;
                consumption.matched += lot.quantity;
                consumption.lots.push(ConsumedLot {
                    date: lot.date,
                    quantity: lot.quantity,
                    price: lot.price,
                    fees: lot.fees,
                });
            } else {
                let fee_share = front.fees * remaining / front.quantity;
                consumption.cost_basis += remaining * front.price + fee_share;
                consumption.matched += remaining;
                consumption.lots.push(ConsumedLot {
                    date: front.date,
                    quantity: remaining,
                    price: front.price,
                    fees: fee_share,
                });
                front.quantity -= remaining;
                front.fees -= fee_share;
                remaining = Decimal::ZERO;
            }
        }

        consumption.unmatched = remaining;
        consumption
    }
}

/// Ids of same-day SELL/BUY pairs that move a position between accounts
/// rather than trading it. Each transaction pairs at most once.
pub fn detect_round_trips(transactions: &[Transaction]) -> HashSet<Id> {
    let mut by_date: BTreeMap<NaiveDate, Vec<&Transaction>> = BTreeMap::new();
    for txn in transactions {
        by_date.entry(txn.date).or_default().push(txn);
    }

    let mut excluded = HashSet::new();
    for day in by_date.values() {
        let sells = day.iter().filter(|t| t.kind == TransactionKind::Sell);
        let mut buys: Vec<&Transaction> = day
            .iter()
            .copied()
            .filter(|t| t.kind == TransactionKind::Buy)
            .collect();
        for sell in sells {
            let matched = buys.iter().position(|buy| {
                (sell.quantity - buy.quantity).abs() < ROUND_TRIP_QUANTITY_TOLERANCE
                    && (sell.price - buy.price).abs() < ROUND_TRIP_PRICE_TOLERANCE
            });
            if let Some(index) = matched {
                let buy = buys.remove(index);
                excluded.insert(sell.id.clone());
                excluded.insert(buy.id.clone());
            }
        }
    }
    excluded
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaleRealization {
    pub transaction_id: Id,
    pub holding_id: Id,
    pub symbol: String,
    pub date: NaiveDate,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fees: Decimal,
    pub proceeds: Decimal,
    pub cost_basis: Decimal,
    pub realized_gain: Decimal,
    pub cost_per_share: Decimal,
    pub gain_per_share: Decimal,
    /// Quantity sold beyond every lot ever bought.
    pub unmatched_quantity: Decimal,
    pub lots_consumed: String,
    pub currency: String,
}

/// Realized results for one holding, in its own currency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HoldingRealization {
    pub holding_id: Id,
    pub symbol: String,
    pub currency: String,
    pub sales: Vec<SaleRealization>,
    pub realized_gain: Decimal,
    pub proceeds: Decimal,
    pub cost_basis: Decimal,
    pub transfers_excluded: usize,
    pub open_lots: Vec<Lot>,
    pub warnings: Vec<String>,
}

fn describe_lots(consumption: &Consumption) -> String {
    let mut parts: Vec<String> = consumption
        .lots
        .iter()
        .map(|l| {
            format!(
                "{} @ {} ({})",
                l.quantity.normalize(),
                l.price.normalize(),
                l.date
            )
        })
        .collect();
    if consumption.unmatched > Decimal::ZERO {
        parts.push(format!("{} unmatched", consumption.unmatched.normalize()));
    }
    parts.join(" + ")
}

/// Run FIFO matching over a holding's ledger (in ledger order).
pub fn realize_holding(holding: &Holding, transactions: &[Transaction]) -> HoldingRealization {
    let transfers = detect_round_trips(transactions);
    let mut queue = LotQueue::new();
    let mut sales = Vec::new();
    let mut warnings = Vec::new();

    for txn in transactions {
        if transfers.contains(&txn.id) {
            continue;
        }
        match txn.kind {
            TransactionKind::Buy => queue.push(Lot {
                date: txn.date,
                quantity: txn.quantity,
                price: txn.price,
                fees: txn.fees,
            }),
            TransactionKind::Sell => {
                let proceeds = txn.gross() - txn.fees;
                let consumption = queue.consume(txn.quantity);
                if consumption.unmatched > Decimal::ZERO {
                    warnings.push(format!(
                        "{} {}: sold {} but only {} was available; the excess has no cost basis",
                        txn.date, holding.symbol, txn.quantity, consumption.matched
                    ));
                }
                let realized_gain = proceeds - consumption.cost_basis;
                // Per-share figures spread over the whole sale, unmatched excess included.
                let per_share =
                    |amount: Decimal| amount.checked_div(txn.quantity).unwrap_or(Decimal::ZERO);
                sales.push(SaleRealization {
                    transaction_id: txn.id.clone(),
                    holding_id: holding.id.clone(),
                    symbol: holding.symbol.clone(),
                    date: txn.date,
                    quantity: txn.quantity,
                    price: txn.price,
                    fees: txn.fees,
                    proceeds,
                    cost_basis: consumption.cost_basis,
                    realized_gain,
                    cost_per_share: per_share(consumption.cost_basis),
                    gain_per_share: per_share(realized_gain),
                    unmatched_quantity: consumption.unmatched,
                    lots_consumed: describe_lots(&consumption),
                    currency: holding.currency.clone(),
                });
            }
        }
    }

    HoldingRealization {
        holding_id: holding.id.clone(),
        symbol: holding.symbol.clone(),
        currency: holding.currency.clone(),
        realized_gain: sales.iter().map(|s| s.realized_gain).sum(),
        proceeds: sales.iter().map(|s| s.proceeds).sum(),
        cost_basis: sales.iter().map(|s| s.cost_basis).sum(),
        sales,
        transfers_excluded: transfers.len(),
        open_lots: queue.lots().cloned().collect(),
        warnings,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GainTotals {
    pub realized_gain: Decimal,
    pub proceeds: Decimal,
    pub cost_basis: Decimal,
    pub sales: usize,
}

impl GainTotals {
    fn add(&mut self, gain: Decimal, proceeds: Decimal, cost: Decimal, sales: usize) {
        self.realized_gain += gain;
        self.proceeds += proceeds;
        self.cost_basis += cost;
        self.sales += sales;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HoldingGains {
    pub holding_id: Id,
    pub symbol: String,
    pub account: String,
    pub currency: String,
    /// In the holding's currency.
    pub native: GainTotals,
    /// In the report currency.
    pub converted: GainTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealizedGainsReport {
    pub currency: String,
    pub total_realized_gain: Decimal,
    pub total_proceeds: Decimal,
    pub total_cost_basis: Decimal,
    pub by_holding: Vec<HoldingGains>,
    pub by_year: BTreeMap<i32, GainTotals>,
    pub sales: Vec<SaleRealization>,
    pub transfers_excluded: usize,
    pub warnings: Vec<String>,
}

/// Builds [`RealizedGainsReport`]s from stored ledgers.
///
/// Amounts are converted to the base currency at today's rate, not the
/// rate on the sale date.
pub struct RealizedGainsCalculator {
    storage: Arc<dyn Storage>,
    currency: Arc<CurrencyService>,
    base_currency: String,
}

impl RealizedGainsCalculator {
    pub fn new(
        storage: Arc<dyn Storage>,
        currency: Arc<CurrencyService>,
        base_currency: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            currency,
            base_currency: base_currency.into().to_uppercase(),
        }
    }

    /// Gains for every holding matching `filter`, closed positions included.
    /// With `year`, only sales dated in that year are counted.
    pub async fn report(&self, filter: &HoldingFilter, year: Option<i32>) -> Result<RealizedGainsReport> {
        let mut holdings: Vec<Holding> = self
            .storage
            .list_holdings()
            .await?
            .into_iter()
            .filter(|h| filter.matches(h))
            .collect();
        holdings.sort_by(|a, b| a.symbol.cmp(&b.symbol).then_with(|| a.account.cmp(&b.account)));

        let today = self.currency.today();
        let mut report = RealizedGainsReport {
            currency: self.base_currency.clone(),
            total_realized_gain: Decimal::ZERO,
            total_proceeds: Decimal::ZERO,
            total_cost_basis: Decimal::ZERO,
            by_holding: Vec::new(),
            by_year: BTreeMap::new(),
            sales: Vec::new(),
            transfers_excluded: 0,
            warnings: Vec::new(),
        };

        for holding in holdings {
            let txns = self
                .storage
                .transactions_for(&holding.id, &DateRange::all())
                .await?;
            if txns.is_empty() {
                continue;
            }
            let mut realization = realize_holding(&holding, &txns);
            if let Some(year) = year {
                realization.sales.retain(|s| s.date.year() == year);
            }
            report.transfers_excluded += realization.transfers_excluded;
            report.warnings.append(&mut realization.warnings);
            if realization.sales.is_empty() {
                continue;
            }

            let rate = match self
                .currency
                .rate(&holding.currency, &self.base_currency, today)
                .await
            {
                Some(rate) => rate,
                None => {
                    warn!(symbol = %holding.symbol, currency = %holding.currency, "no rate, gains left unconverted");
                    report.warnings.push(format!(
                        "{}: no {}->{} rate; amounts left in {}",
                        holding.symbol, holding.currency, self.base_currency, holding.currency
                    ));
                    Decimal::ONE
                }
            };

            let mut native = GainTotals::default();
            let mut converted = GainTotals::default();
            for sale in &realization.sales {
                native.add(sale.realized_gain, sale.proceeds, sale.cost_basis, 1);
                let (gain, proceeds, cost) = (
                    sale.realized_gain * rate,
                    sale.proceeds * rate,
                    sale.cost_basis * rate,
                );
                converted.add(gain, proceeds, cost, 1);
                report
                    .by_year
                    .entry(sale.date.year())
                    .or_default()
                    .add(gain, proceeds, cost, 1);
            }

            report.total_realized_gain += converted.realized_gain;
            report.total_proceeds += converted.proceeds;
            report.total_cost_basis += converted.cost_basis;
            debug!(
                symbol = %holding.symbol,
                sales = realization.sales.len(),
                gain = %converted.realized_gain,
                "realized gains computed"
            );
            report.by_holding.push(HoldingGains {
                holding_id: holding.id.clone(),
                symbol: holding.symbol.clone(),
                account: holding.account_key().to_string(),
                currency: holding.currency.clone(),
                native,
                converted,
            });
            report.sales.append(&mut realization.sales);
        }

        report.sales.sort_by_key(|s| s.date);
        Ok(report)
    }
}
