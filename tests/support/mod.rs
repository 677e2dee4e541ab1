#![allow(dead_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use holdbook::clock::{Clock, FixedClock};
use holdbook::config::PriceConfig;
use holdbook::currency::CurrencyService;
use holdbook::market_data::{
    ExchangeRate, FxRateSource, Instrument, MarketDataStore, MemoryMarketDataStore, PriceBar,
    PriceService, PriceSource, Quote,
};
use holdbook::portfolio::{Analytics, Ledger, RealizedGainsCalculator, SnapshotEngine};
use holdbook::storage::{MemoryStorage, Storage};
use rust_decimal::Decimal;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap()
}

/// Price source with fixed quotes and bars, counting calls.
#[derive(Default)]
pub struct MockPrices {
    quotes: HashMap<String, (Decimal, Option<Decimal>)>,
    bars: Vec<PriceBar>,
    pub quote_calls: AtomicUsize,
    pub history_calls: AtomicUsize,
}

impl MockPrices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quote(mut self, symbol: &str, price: &str, previous_close: Option<&str>) -> Self {
        self.quotes
            .insert(symbol.to_string(), (dec(price), previous_close.map(dec)));
        self
    }

    pub fn with_bar(mut self, instrument: &Instrument, date: NaiveDate, close: &str) -> Self {
        self.bars
            .push(PriceBar::close_only(instrument.clone(), date, dec(close), "mock"));
        self
    }
}

#[async_trait]
impl PriceSource for MockPrices {
    async fn fetch_quotes(&self, instruments: &[Instrument]) -> Result<HashMap<Instrument, Quote>> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        Ok(instruments
            .iter()
            .filter_map(|instrument| {
                let (price, previous_close) = self.quotes.get(&instrument.symbol)?;
                Some((
                    instrument.clone(),
                    Quote {
                        instrument: instrument.clone(),
                        price: *price,
                        previous_close: *previous_close,
                        currency: None,
                        fetched_at: Utc::now(),
                    },
                ))
            })
            .collect())
    }

    async fn fetch_history(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .bars
            .iter()
            .filter(|bar| &bar.instrument == instrument && bar.date >= start && bar.date <= end)
            .cloned()
            .collect())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// FX source with a fixed table; unknown pairs have no rate.
#[derive(Default)]
pub struct MockRates {
    rates: HashMap<(String, String), Decimal>,
    pub calls: AtomicUsize,
}

impl MockRates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, from: &str, to: &str, rate: &str) -> Self {
        self.rates
            .insert((from.to_string(), to.to_string()), dec(rate));
        self
    }
}

#[async_trait]
impl FxRateSource for MockRates {
    async fn fetch_close(&self, from: &str, to: &str, date: NaiveDate) -> Result<Option<ExchangeRate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rates
            .get(&(from.to_string(), to.to_string()))
            .map(|rate| ExchangeRate {
                from: from.to_string(),
                to: to.to_string(),
                date,
                rate: *rate,
                source: "mock".to_string(),
            }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// In-memory storage and market data wired to mock sources with a fixed "today".
pub struct Harness {
    pub storage: Arc<dyn Storage>,
    pub market: Arc<MemoryMarketDataStore>,
    pub prices: Arc<PriceService>,
    pub currency: Arc<CurrencyService>,
    pub clock: Arc<dyn Clock>,
}

impl Harness {
    pub fn new(today: NaiveDate, prices: MockPrices, rates: MockRates) -> Self {
        Self::with_storage(Arc::new(MemoryStorage::new()), today, prices, rates)
    }

    pub fn with_storage(
        storage: Arc<dyn Storage>,
        today: NaiveDate,
        prices: MockPrices,
        rates: MockRates,
    ) -> Self {
        let market = Arc::new(MemoryMarketDataStore::new());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::on_date(today));
        let price_config = PriceConfig {
            min_request_interval: Duration::ZERO,
            ..PriceConfig::default()
        };
        let prices = PriceService::new(market.clone(), Arc::new(prices))
            .with_clock(clock.clone())
            .with_config(&price_config);
        let currency = CurrencyService::new(market.clone(), Arc::new(rates)).with_clock(clock.clone());
        Self {
            storage,
            market,
            prices: Arc::new(prices),
            currency: Arc::new(currency),
            clock,
        }
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::new(self.storage()).with_clock(self.clock.clone())
    }

    pub fn snapshots(&self) -> SnapshotEngine {
        SnapshotEngine::new(self.storage(), self.prices.clone(), self.currency.clone(), "CAD")
            .with_clock(self.clock.clone())
    }

    pub fn analytics(&self) -> Analytics {
        Analytics::new(self.storage(), self.prices.clone(), self.currency.clone(), "CAD")
            .with_clock(self.clock.clone())
    }

    pub fn gains(&self) -> RealizedGainsCalculator {
        RealizedGainsCalculator::new(self.storage(), self.currency.clone(), "CAD")
    }

    pub async fn add_bar(&self, instrument: &Instrument, date: NaiveDate, close: &str) -> Result<()> {
        self.market
            .put_bars(&[PriceBar::close_only(instrument.clone(), date, dec(close), "test")])
            .await?;
        Ok(())
    }
}
