use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use chrono::{Duration, NaiveDate};

use super::{CachedPrice, ExchangeRate, Instrument, PriceBar};

#[async_trait::async_trait]
pub trait MarketDataStore: Send + Sync {
    async fn get_bar(&self, instrument: &Instrument, date: NaiveDate) -> Result<Option<PriceBar>>;

    /// Most recent bar dated on or before `date` and no more than
    /// `tolerance_days` earlier.
    async fn latest_bar_on_or_before(
        &self,
        instrument: &Instrument,
        date: NaiveDate,
        tolerance_days: u32,
    ) -> Result<Option<PriceBar>>;

    /// Insert bars whose `(instrument, date)` is not stored yet. Returns the
    /// number inserted; existing bars are kept as they are.
    async fn put_bars(&self, bars: &[PriceBar]) -> Result<usize>;

    async fn get_current_price(&self, instrument: &Instrument) -> Result<Option<CachedPrice>>;

    async fn put_current_prices(&self, prices: &[CachedPrice]) -> Result<()>;

    async fn get_rate(&self, from: &str, to: &str, date: NaiveDate)
        -> Result<Option<ExchangeRate>>;

    /// Upsert on `(from, to, date)`.
    async fn put_rate(&self, rate: &ExchangeRate) -> Result<()>;
}

pub(crate) fn tolerance_floor(date: NaiveDate, tolerance_days: u32) -> NaiveDate {
    date.checked_sub_signed(Duration::days(i64::from(tolerance_days)))
        .unwrap_or(NaiveDate::MIN)
}

#[derive(Default)]
pub struct MemoryMarketDataStore {
    bars: tokio::sync::Mutex<HashMap<Instrument, BTreeMap<NaiveDate, PriceBar>>>,
    current: tokio::sync::Mutex<HashMap<Instrument, CachedPrice>>,
    rates: tokio::sync::Mutex<HashMap<(String, String, NaiveDate), ExchangeRate>>,
}

impl MemoryMarketDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn bar_count(&self, instrument: &Instrument) -> usize {
        self.bars
            .lock()
            .await
            .get(instrument)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait::async_trait]
impl MarketDataStore for MemoryMarketDataStore {
    async fn get_bar(&self, instrument: &Instrument, date: NaiveDate) -> Result<Option<PriceBar>> {
        let bars = self.bars.lock().await;
        Ok(bars
            .get(instrument)
            .and_then(|series| series.get(&date))
            .cloned())
    }

    async fn latest_bar_on_or_before(
        &self,
        instrument: &Instrument,
        date: NaiveDate,
        tolerance_days: u32,
    ) -> Result<Option<PriceBar>> {
        let floor = tolerance_floor(date, tolerance_days);
        let bars = self.bars.lock().await;
        Ok(bars
            .get(instrument)
            .and_then(|series| series.range(floor..=date).next_back())
            .map(|(_, bar)| bar.clone()))
    }

    async fn put_bars(&self, bars: &[PriceBar]) -> Result<usize> {
        let mut store = self.bars.lock().await;
        let mut inserted = 0;
        for bar in bars {
            let series = store.entry(bar.instrument.clone()).or_default();
            if !series.contains_key(&bar.date) {
                series.insert(bar.date, bar.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_current_price(&self, instrument: &Instrument) -> Result<Option<CachedPrice>> {
        Ok(self.current.lock().await.get(instrument).cloned())
    }

    async fn put_current_prices(&self, prices: &[CachedPrice]) -> Result<()> {
        let mut current = self.current.lock().await;
        for price in prices {
            current.insert(price.instrument.clone(), price.clone());
        }
        Ok(())
    }

    async fn get_rate(
        &self,
        from: &str,
        to: &str,
        date: NaiveDate,
    ) -> Result<Option<ExchangeRate>> {
        let rates = self.rates.lock().await;
        Ok(rates
            .get(&(from.to_string(), to.to_string(), date))
            .cloned())
    }

    async fn put_rate(&self, rate: &ExchangeRate) -> Result<()> {
        self.rates
            .lock()
            .await
            .insert((rate.from.clone(), rate.to.clone(), rate.date), rate.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn bar(date: NaiveDate, close: i64) -> PriceBar {
        PriceBar::close_only(Instrument::new("XEQT", "TSX"), date, Decimal::from(close), "test")
    }

    #[tokio::test]
    async fn put_bars_keeps_existing_dates() -> Result<()> {
        let store = MemoryMarketDataStore::new();
        assert_eq!(store.put_bars(&[bar(day(4), 30), bar(day(5), 31)]).await?, 2);
        assert_eq!(store.put_bars(&[bar(day(5), 99), bar(day(6), 32)]).await?, 1);

        let instrument = Instrument::new("XEQT", "TSX");
        let kept = store.get_bar(&instrument, day(5)).await?.unwrap();
        assert_eq!(kept.close, Decimal::from(31));
        assert_eq!(store.bar_count(&instrument).await, 3);
        Ok(())
    }

    #[tokio::test]
    async fn nearest_bar_respects_tolerance() -> Result<()> {
        let store = MemoryMarketDataStore::new();
        store.put_bars(&[bar(day(1), 30), bar(day(8), 35)]).await?;
        let instrument = Instrument::new("XEQT", "TSX");

        let found = store.latest_bar_on_or_before(&instrument, day(11), 5).await?;
        assert_eq!(found.map(|b| b.date), Some(day(8)));

        // day(1) is 6 days before day(7)
        assert!(store
            .latest_bar_on_or_before(&instrument, day(7), 5)
            .await?
            .is_none());
        Ok(())
    }
}
