//! Read-only views over the active holdings at current prices.
//!
//! Every view first prices the holdings, either from the stored
//! current-price cache (`Fast`, no change data) or from the price service
//! (`Live`, with previous close). Amounts are converted to the base currency
//! at today's rate.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::recommendations::{
    briefing_alerts, recommend, Alert, HoldingMetrics, RecommendationReport,
};
use super::snapshot::ValuationSource;
use crate::clock::{Clock, SystemClock};
use crate::config::RecommendationConfig;
use crate::currency::CurrencyService;
use crate::market_data::{Instrument, PriceService};
use crate::models::{gain_pct, Country, Holding};
use crate::storage::{HoldingFilter, Storage};

const TOP_HOLDINGS: usize = 10;
const PERFORMERS: usize = 5;
const BRIEFING_MOVERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceMode {
    /// Stored current prices only.
    Fast,
    /// Price service, with previous close where the source has it.
    Live,
}

/// A holding with its current price. `value`, `cost` and `day_change_value`
/// are in the base currency.
#[derive(Debug, Clone)]
pub struct PricedHolding {
    pub holding: Holding,
    pub price: Decimal,
    pub previous_close: Option<Decimal>,
    pub day_change: Decimal,
    pub day_change_pct: Decimal,
    pub value: Decimal,
    pub cost: Decimal,
    pub previous_value: Option<Decimal>,
    pub day_change_value: Decimal,
    pub source: ValuationSource,
}

impl PricedHolding {
    pub fn unrealized_gain(&self) -> Decimal {
        self.value - self.cost
    }

    pub fn unrealized_gain_pct(&self) -> Decimal {
        gain_pct(self.unrealized_gain(), self.cost)
    }
}

#[derive(Debug, Clone)]
pub struct PricedPortfolio {
    pub holdings: Vec<PricedHolding>,
    /// Active holdings without any price.
    pub unpriced: Vec<String>,
    pub warnings: Vec<String>,
    pub mode: PriceMode,
}

impl PricedPortfolio {
    pub fn total_value(&self) -> Decimal {
        self.holdings.iter().map(|h| h.value).sum()
    }

    pub fn total_cost(&self) -> Decimal {
        self.holdings.iter().map(|h| h.cost).sum()
    }

    fn allocation_pct(&self, value: Decimal) -> Decimal {
        gain_pct(value, self.total_value())
    }

    /// Inputs for the recommendation and alert rules.
    pub fn metrics(&self) -> Vec<HoldingMetrics> {
        self.holdings
            .iter()
            .map(|h| HoldingMetrics {
                symbol: h.holding.symbol.clone(),
                name: h.holding.name.clone(),
                country: h.holding.country,
                market_value: h.value,
                cost_basis: h.cost,
                gain_pct: h.unrealized_gain_pct(),
                day_change_pct: h.day_change_pct,
                allocation_pct: self.allocation_pct(h.value),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioSummary {
    pub currency: String,
    pub total_value: Decimal,
    pub total_cost: Decimal,
    pub unrealized_gain: Decimal,
    pub unrealized_gain_pct: Decimal,
    pub today_change: Decimal,
    pub today_change_pct: Decimal,
    pub holdings_count: usize,
    pub countries: BTreeMap<Country, usize>,
    pub source: PriceMode,
    pub warnings: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HoldingWeight {
    pub symbol: String,
    pub name: Option<String>,
    pub quantity: Decimal,
    pub current_price: Decimal,
    pub currency: String,
    pub market_value: Decimal,
    pub percentage: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allocation {
    pub by_country: BTreeMap<Country, Decimal>,
    pub by_exchange: BTreeMap<String, Decimal>,
    pub top_holdings: Vec<HoldingWeight>,
    pub total_value: Decimal,
    pub source: PriceMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HoldingPerformance {
    pub symbol: String,
    pub name: Option<String>,
    pub current_price: Decimal,
    pub avg_cost: Decimal,
    pub gain: Decimal,
    pub gain_pct: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Performance {
    pub best_performers: Vec<HoldingPerformance>,
    pub worst_performers: Vec<HoldingPerformance>,
    pub total_holdings: usize,
    pub source: PriceMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HoldingMove {
    pub symbol: String,
    pub name: Option<String>,
    pub exchange: String,
    pub currency: String,
    pub quantity: Decimal,
    pub current_price: Decimal,
    pub previous_close: Option<Decimal>,
    pub day_change: Decimal,
    pub day_change_pct: Decimal,
    pub day_change_value: Decimal,
    pub market_value: Decimal,
    pub unrealized_gain: Decimal,
    pub unrealized_gain_pct: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyMovers {
    pub all_holdings: Vec<HoldingMove>,
    pub top_gainers: Vec<HoldingMove>,
    pub top_losers: Vec<HoldingMove>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountHolding {
    pub symbol: String,
    pub name: Option<String>,
    pub quantity: Decimal,
    pub value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSummary {
    pub name: String,
    pub value: Decimal,
    pub cost: Decimal,
    pub gain: Decimal,
    pub gain_pct: Decimal,
    pub allocation_pct: Decimal,
    pub holdings_count: usize,
    pub holdings: Vec<AccountHolding>,
    pub is_tax_advantaged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountBreakdown {
    pub by_account: BTreeMap<String, AccountSummary>,
    pub tax_advantaged_total: Decimal,
    pub taxable_total: Decimal,
    pub tax_advantaged_pct: Decimal,
    pub total_value: Decimal,
    pub source: PriceMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Briefing {
    pub summary: PortfolioSummary,
    pub top_gainers: Vec<HoldingMove>,
    pub top_losers: Vec<HoldingMove>,
    pub alerts: Vec<Alert>,
}

pub struct Analytics {
    storage: Arc<dyn Storage>,
    prices: Arc<PriceService>,
    currency: Arc<CurrencyService>,
    base_currency: String,
    thresholds: RecommendationConfig,
    clock: Arc<dyn Clock>,
}

impl Analytics {
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
            thresholds: RecommendationConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_thresholds(mut self, thresholds: RecommendationConfig) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Price every active holding matching `filter`.
    ///
    /// Fixed-income holdings are valued at cost without a lookup. A holding
    /// with no quote falls back to its latest manual valuation; one without
    /// either is listed in `unpriced` and left out of every total.
    pub async fn price_holdings(&self, filter: &HoldingFilter, mode: PriceMode) -> Result<PricedPortfolio> {
        let holdings = self.storage.list_active_holdings(filter).await?;
        let instruments: Vec<Instrument> = holdings
            .iter()
            .filter(|h| !h.is_constant_value())
            .map(Holding::instrument)
            .collect();
        let today = self.clock.today();

        let mut quotes: BTreeMap<Instrument, (Decimal, Option<Decimal>, Decimal, Decimal)> =
            BTreeMap::new();
        match mode {
            PriceMode::Fast => {
                for instrument in &instruments {
                    if let Some(cached) = self.prices.cached_price(instrument).await {
                        quotes.insert(instrument.clone(), (cached.price, None, Decimal::ZERO, Decimal::ZERO));
                    }
                }
            }
            PriceMode::Live => {
                for (instrument, change) in self.prices.current_prices_with_change_bulk(&instruments).await {
                    if let Some(c) = change {
                        quotes.insert(instrument, (c.price, c.previous_close, c.change, c.change_pct));
                    }
                }
            }
        }

        let mut priced = Vec::new();
        let mut unpriced = Vec::new();
        let mut warnings = Vec::new();
        for holding in holdings {
            let quantity = holding.quantity;
            // Amounts in the holding's currency until converted below.
            let (price, previous_close, day_change, day_change_pct, native_value, source) =
                if holding.is_constant_value() {
                    let cost = holding.cost_basis();
                    (holding.avg_cost, None, Decimal::ZERO, Decimal::ZERO, cost, ValuationSource::ConstantValue)
                } else if let Some(&(price, previous_close, change, change_pct)) =
                    quotes.get(&holding.instrument())
                {
                    (price, previous_close, change, change_pct, quantity * price, ValuationSource::Market)
                } else if let Some(manual) = self
                    .storage
                    .manual_valuation_on_or_before(&holding.id, today)
                    .await?
                {
                    debug!(symbol = %holding.symbol, date = %manual.date, value = %manual.value, "using manual valuation");
                    let price = manual.value.checked_div(quantity).unwrap_or(Decimal::ZERO);
                    (price, None, Decimal::ZERO, Decimal::ZERO, manual.value, ValuationSource::Manual)
                } else {
                    warn!(symbol = %holding.symbol, exchange = %holding.exchange, "no price available");
                    unpriced.push(holding.symbol.clone());
                    continue;
                };

            let rate = match self
                .currency
                .rate(&holding.currency, &self.base_currency, today)
                .await
            {
                Some(rate) => rate,
                None => {
                    warnings.push(format!(
                        "{}: no {}->{} rate; amounts left in {}",
                        holding.symbol, holding.currency, self.base_currency, holding.currency
                    ));
                    Decimal::ONE
                }
            };

            priced.push(PricedHolding {
                price,
                previous_close,
                day_change,
                day_change_pct,
                value: native_value * rate,
                cost: holding.cost_basis() * rate,
                previous_value: previous_close.map(|close| quantity * close * rate),
                day_change_value: quantity * day_change * rate,
                source,
                holding,
            });
        }

        debug!(priced = priced.len(), unpriced = unpriced.len(), mode = ?mode, "holdings priced");
        Ok(PricedPortfolio {
            holdings: priced,
            unpriced,
            warnings,
            mode,
        })
    }

    pub async fn summary(&self, mode: PriceMode) -> Result<PortfolioSummary> {
        let portfolio = self.price_holdings(&HoldingFilter::all(), mode).await?;
        self.summarize(&portfolio).await
    }

    async fn summarize(&self, portfolio: &PricedPortfolio) -> Result<PortfolioSummary> {
        let active = self.storage.list_active_holdings(&HoldingFilter::all()).await?;
        let mut countries: BTreeMap<Country, usize> = BTreeMap::new();
        for holding in &active {
            *countries.entry(holding.country).or_default() += 1;
        }

        let total_value = portfolio.total_value();
        let total_cost = portfolio.total_cost();
        let unrealized_gain = total_value - total_cost;

        // Only holdings with a previous close have a known change today.
        let (previous_value, change): (Decimal, Decimal) = portfolio
            .holdings
            .iter()
            .filter_map(|h| h.previous_value.map(|previous| (previous, h.value - previous)))
            .fold((Decimal::ZERO, Decimal::ZERO), |(p, c), (previous, change)| {
                (p + previous, c + change)
            });
        let (today_change, today_change_pct) = if previous_value > Decimal::ZERO {
            (change, gain_pct(change, previous_value))
        } else {
            self.change_from_last_snapshot(total_value).await?
        };

        let mut warnings = portfolio.warnings.clone();
        warnings.extend(portfolio.unpriced.iter().map(|s| format!("{s}: no price available")));

        Ok(PortfolioSummary {
            currency: self.base_currency.clone(),
            total_value,
            total_cost,
            unrealized_gain,
            unrealized_gain_pct: gain_pct(unrealized_gain, total_cost),
            today_change,
            today_change_pct,
            holdings_count: active.len(),
            countries,
            source: portfolio.mode,
            warnings,
            last_updated: self.clock.now(),
        })
    }

    /// `current_value` against the latest snapshot before today.
    async fn change_from_last_snapshot(&self, current_value: Decimal) -> Result<(Decimal, Decimal)> {
        let today = self.clock.today();
        match self.storage.latest_snapshot_before(today).await? {
            Some(previous) => {
                let change = current_value - previous.total_value;
                Ok((change, gain_pct(change, previous.total_value)))
            }
            None => Ok((Decimal::ZERO, Decimal::ZERO)),
        }
    }

    pub async fn allocation(&self, mode: PriceMode) -> Result<Allocation> {
        let portfolio = self.price_holdings(&HoldingFilter::all(), mode).await?;
        let total_value = portfolio.total_value();

        let mut by_country: BTreeMap<Country, Decimal> = BTreeMap::new();
        let mut by_exchange: BTreeMap<String, Decimal> = BTreeMap::new();
        for h in &portfolio.holdings {
            *by_country.entry(h.holding.country).or_default() += h.value;
            *by_exchange.entry(h.holding.exchange.clone()).or_default() += h.value;
        }
        for value in by_country.values_mut().chain(by_exchange.values_mut()) {
            *value = gain_pct(*value, total_value);
        }

        let mut weights: Vec<HoldingWeight> = portfolio
            .holdings
            .iter()
            .map(|h| HoldingWeight {
                symbol: h.holding.symbol.clone(),
                name: h.holding.name.clone(),
                quantity: h.holding.quantity,
                current_price: h.price,
                currency: h.holding.currency.clone(),
                market_value: h.value,
                percentage: gain_pct(h.value, total_value),
            })
            .collect();
        weights.sort_by(|a, b| b.market_value.cmp(&a.market_value));
        weights.truncate(TOP_HOLDINGS);

        Ok(Allocation {
            by_country,
            by_exchange,
            top_holdings: weights,
            total_value,
            source: mode,
        })
    }

    /// Price against average cost, per unit and in the holding's currency.
    pub async fn performance(&self, mode: PriceMode) -> Result<Performance> {
        let portfolio = self.price_holdings(&HoldingFilter::all(), mode).await?;
        let mut rows: Vec<HoldingPerformance> = portfolio
            .holdings
            .iter()
            .map(|h| {
                let gain = h.price - h.holding.avg_cost;
                HoldingPerformance {
                    symbol: h.holding.symbol.clone(),
                    name: h.holding.name.clone(),
                    current_price: h.price,
                    avg_cost: h.holding.avg_cost,
                    gain,
                    gain_pct: gain_pct(gain, h.holding.avg_cost),
                    currency: h.holding.currency.clone(),
                }
            })
            .collect();
        rows.sort_by(|a, b| b.gain_pct.cmp(&a.gain_pct));

        let best = rows.iter().take(PERFORMERS).cloned().collect();
        let worst = rows.iter().rev().take(PERFORMERS).cloned().collect();
        Ok(Performance {
            best_performers: best,
            worst_performers: worst,
            total_holdings: rows.len(),
            source: mode,
        })
    }

    /// Day change for every priced holding, best first, plus up to `limit`
    /// gainers and losers. Always uses live prices.
    pub async fn daily_movers(&self, limit: usize) -> Result<DailyMovers> {
        let portfolio = self.price_holdings(&HoldingFilter::all(), PriceMode::Live).await?;
        Ok(movers(&portfolio, limit))
    }

    pub async fn account_breakdown(&self, mode: PriceMode) -> Result<AccountBreakdown> {
        let portfolio = self.price_holdings(&HoldingFilter::all(), mode).await?;
        let total_value = portfolio.total_value();

        let mut by_account: BTreeMap<String, AccountSummary> = BTreeMap::new();
        let mut tax_advantaged_total = Decimal::ZERO;
        let mut taxable_total = Decimal::ZERO;
        for h in &portfolio.holdings {
            let key = h.holding.account_key().to_string();
            let account_type = h.holding.account_type();
            let tax_advantaged = account_type.is_some_and(|t| t.is_tax_advantaged());
            let entry = by_account.entry(key.clone()).or_insert_with(|| AccountSummary {
                name: account_type.map(|t| t.label().to_string()).unwrap_or(key),
                value: Decimal::ZERO,
                cost: Decimal::ZERO,
                gain: Decimal::ZERO,
                gain_pct: Decimal::ZERO,
                allocation_pct: Decimal::ZERO,
                holdings_count: 0,
                holdings: Vec::new(),
                is_tax_advantaged: tax_advantaged,
            });
            entry.value += h.value;
            entry.cost += h.cost;
            entry.holdings_count += 1;
            entry.holdings.push(AccountHolding {
                symbol: h.holding.symbol.clone(),
                name: h.holding.name.clone(),
                quantity: h.holding.quantity,
                value: h.value,
            });

            if tax_advantaged {
                tax_advantaged_total += h.value;
            } else {
                taxable_total += h.value;
            }
        }

        for account in by_account.values_mut() {
            account.gain = account.value - account.cost;
            account.gain_pct = gain_pct(account.gain, account.cost);
            account.allocation_pct = gain_pct(account.value, total_value);
            account.holdings.sort_by(|a, b| b.value.cmp(&a.value));
        }

        Ok(AccountBreakdown {
            by_account,
            tax_advantaged_total,
            taxable_total,
            tax_advantaged_pct: gain_pct(tax_advantaged_total, total_value),
            total_value,
            source: mode,
        })
    }

    pub async fn recommendations(&self, mode: PriceMode) -> Result<RecommendationReport> {
        let portfolio = self.price_holdings(&HoldingFilter::all(), mode).await?;
        if portfolio.holdings.is_empty() {
            return Ok(RecommendationReport::empty());
        }
        let report = recommend(&portfolio.metrics(), &self.thresholds);
        info!(
            recommendations = report.recommendations.len(),
            health = report.health_score,
            "recommendations generated"
        );
        Ok(report)
    }

    /// Summary, top movers and alerts from a single live pricing pass.
    pub async fn briefing(&self) -> Result<Briefing> {
        let portfolio = self.price_holdings(&HoldingFilter::all(), PriceMode::Live).await?;
        let summary = self.summarize(&portfolio).await?;
        let movers = movers(&portfolio, BRIEFING_MOVERS);
        Ok(Briefing {
            summary,
            top_gainers: movers.top_gainers,
            top_losers: movers.top_losers,
            alerts: briefing_alerts(&portfolio.metrics(), &self.thresholds),
        })
    }
}

fn movers(portfolio: &PricedPortfolio, limit: usize) -> DailyMovers {
    let mut all: Vec<HoldingMove> = portfolio
        .holdings
        .iter()
        .map(|h| HoldingMove {
            symbol: h.holding.symbol.clone(),
            name: h.holding.name.clone(),
            exchange: h.holding.exchange.clone(),
            currency: h.holding.currency.clone(),
            quantity: h.holding.quantity,
            current_price: h.price,
            previous_close: h.previous_close,
            day_change: h.day_change,
            day_change_pct: h.day_change_pct,
            day_change_value: h.day_change_value,
            market_value: h.value,
            unrealized_gain: h.unrealized_gain(),
            unrealized_gain_pct: h.unrealized_gain_pct(),
        })
        .collect();
    all.sort_by(|a, b| b.day_change_pct.cmp(&a.day_change_pct));

    let top_gainers = all
        .iter()
        .filter(|m| m.day_change_pct > Decimal::ZERO)
        .take(limit)
        .cloned()
        .collect();
    let top_losers = all
        .iter()
        .rev()
        .filter(|m| m.day_change_pct < Decimal::ZERO)
        .take(limit)
        .cloned()
        .collect();
    DailyMovers {
        all_holdings: all,
        top_gainers,
        top_losers,
    }
}
