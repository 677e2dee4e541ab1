use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{CachedPrice, Instrument, MarketDataStore, PriceChange, PriceSource, Quote};
use crate::cache::{SingleFlight, TtlCache};
use crate::clock::{Clock, SystemClock};
use crate::config::PriceConfig;
use crate::duration::format_duration;

/// Current and historical prices for listed instruments.
///
/// Quotes are served from a short-lived in-memory cache. Live calls are
/// spaced by a minimum interval, bounded by a timeout, and deduplicated per
/// instrument: concurrent callers asking for the same instrument wait for
/// the one fetch in flight and then read its result from the cache.
pub struct PriceService {
    store: Arc<dyn MarketDataStore>,
    source: Arc<dyn PriceSource>,
    quotes: TtlCache<Instrument, Quote>,
    flights: SingleFlight<Instrument>,
    last_request: Mutex<Option<Instant>>,
    min_request_interval: Duration,
    fetch_timeout: Duration,
    history_tolerance_days: u32,
    live_window_days: u32,
    clock: Arc<dyn Clock>,
}

impl PriceService {
    pub fn new(store: Arc<dyn MarketDataStore>, source: Arc<dyn PriceSource>) -> Self {
        let config = PriceConfig::default();
        Self {
            store,
            source,
            quotes: TtlCache::new(config.quote_ttl),
            flights: SingleFlight::new(),
            last_request: Mutex::new(None),
            min_request_interval: config.min_request_interval,
            fetch_timeout: config.fetch_timeout,
            history_tolerance_days: config.history_tolerance_days,
            live_window_days: config.live_window_days,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_config(mut self, config: &PriceConfig) -> Self {
        self.quotes = TtlCache::new(config.quote_ttl).with_clock(self.clock.clone());
        self.min_request_interval = config.min_request_interval;
        self.fetch_timeout = config.fetch_timeout;
        self.history_tolerance_days = config.history_tolerance_days;
        self.live_window_days = config.live_window_days;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.quotes = self.quotes.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn MarketDataStore> {
        &self.store
    }

    pub async fn current_price(&self, instrument: &Instrument) -> Option<Decimal> {
        self.quotes(std::slice::from_ref(instrument))
            .await
            .get(instrument)
            .map(|quote| quote.price)
    }

    /// One entry per requested instrument; `None` where no price is available.
    pub async fn current_prices_bulk(
        &self,
        instruments: &[Instrument],
    ) -> HashMap<Instrument, Option<Decimal>> {
        let quotes = self.quotes(instruments).await;
        instruments
            .iter()
            .map(|i| (i.clone(), quotes.get(i).map(|q| q.price)))
            .collect()
    }

    /// Like [`Self::current_prices_bulk`] with change against the previous close.
    /// An instrument with a single known session gets zero change.
    pub async fn current_prices_with_change_bulk(
        &self,
        instruments: &[Instrument],
    ) -> HashMap<Instrument, Option<PriceChange>> {
        let quotes = self.quotes(instruments).await;
        instruments
            .iter()
            .map(|i| (i.clone(), quotes.get(i).map(PriceChange::from)))
            .collect()
    }

    /// Last persisted price, without any live call.
    pub async fn cached_price(&self, instrument: &Instrument) -> Option<CachedPrice> {
        match self.store.get_current_price(instrument).await {
            Ok(price) => price,
            Err(e) => {
                warn!(instrument = %instrument, error = %e, "failed to read cached price");
                None
            }
        }
    }

    /// Closing price on `date`, or the closest earlier session.
    ///
    /// Today resolves to the current price. Future dates have no price.
    pub async fn historical_price(
        &self,
        instrument: &Instrument,
        date: NaiveDate,
    ) -> Result<Option<Decimal>> {
        let today = self.clock.today();
        if date > today {
            debug!(instrument = %instrument, date = %date, "no price for a future date");
            return Ok(None);
        }
        if date == today {
            return Ok(self.current_price(instrument).await);
        }

        if let Some(bar) = self.store.get_bar(instrument, date).await? {
            debug!(instrument = %instrument, date = %date, close = %bar.close, "price found in store");
            return Ok(Some(bar.close));
        }
        if let Some(bar) = self
            .store
            .latest_bar_on_or_before(instrument, date, self.history_tolerance_days)
            .await?
        {
            debug!(
                instrument = %instrument,
                date = %date,
                found = %bar.date,
                close = %bar.close,
                "nearest earlier price found in store"
            );
            return Ok(Some(bar.close));
        }

        let window = chrono::Duration::days(i64::from(self.live_window_days));
        let start = date - window;
        let end = date + chrono::Duration::days(1);
        let bars = match self
            .guarded_fetch("history", self.source.fetch_history(instrument, start, end))
            .await
        {
            Ok(bars) => bars,
            Err(e) => {
                warn!(instrument = %instrument, date = %date, error = %e, "historical lookup failed");
                return Ok(None);
            }
        };

        if let Err(e) = self.store.put_bars(&bars).await {
            warn!(instrument = %instrument, error = %e, "failed to persist price history");
        }

        let closest = bars
            .iter()
            .filter(|bar| bar.date <= date)
            .max_by_key(|bar| bar.date);
        match closest {
            Some(bar) => {
                info!(
                    instrument = %instrument,
                    date = %date,
                    found = %bar.date,
                    close = %bar.close,
                    source = %self.source.name(),
                    "historical price fetched"
                );
                Ok(Some(bar.close))
            }
            None => {
                debug!(instrument = %instrument, date = %date, "no session on or before date");
                Ok(None)
            }
        }
    }

    /// Fetch daily bars over `[start, end]` for each instrument and store the
    /// ones not already present. Returns the number of bars added.
    pub async fn backfill_history(
        &self,
        instruments: &[Instrument],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<usize> {
        let mut created = 0;
        for instrument in instruments {
            let bars = match self
                .guarded_fetch("history", self.source.fetch_history(instrument, start, end))
                .await
            {
                Ok(bars) => bars,
                Err(e) => {
                    warn!(instrument = %instrument, error = %e, "skipping history backfill");
                    continue;
                }
            };
            let added = self.store.put_bars(&bars).await?;
            debug!(instrument = %instrument, fetched = bars.len(), added, "history backfilled");
            created += added;
        }
        info!(instruments = instruments.len(), created, "price history backfill finished");
        Ok(created)
    }

    /// Quotes for the requested instruments, fresh from the cache where
    /// possible and otherwise fetched in one batch.
    async fn quotes(&self, instruments: &[Instrument]) -> HashMap<Instrument, Quote> {
        let requested: BTreeSet<Instrument> = instruments.iter().cloned().collect();
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        for instrument in requested {
            match self.quotes.get(&instrument).await {
                Some(quote) => {
                    found.insert(instrument, quote);
                }
                None => missing.push(instrument),
            }
        }
        if missing.is_empty() {
            return found;
        }

        let _flight = self.flights.claim(missing.iter().cloned()).await;

        // Another caller may have fetched while we waited for the claim.
        let mut still_missing = Vec::new();
        for instrument in missing {
            match self.quotes.get(&instrument).await {
                Some(quote) => {
                    found.insert(instrument, quote);
                }
                None => still_missing.push(instrument),
            }
        }
        if still_missing.is_empty() {
            return found;
        }

        let fetched = self.fetch_live(&still_missing).await;
        for quote in fetched.values() {
            self.quotes.insert(quote.instrument.clone(), quote.clone()).await;
        }
        self.persist(&fetched).await;

        for instrument in &still_missing {
            if !fetched.contains_key(instrument) {
                debug!(instrument = %instrument, "no live quote available");
            }
        }
        found.extend(fetched);
        found
    }

    async fn fetch_live(&self, instruments: &[Instrument]) -> HashMap<Instrument, Quote> {
        match self
            .guarded_fetch("quotes", self.source.fetch_quotes(instruments))
            .await
        {
            Ok(quotes) => {
                debug!(requested = instruments.len(), received = quotes.len(), "live quotes fetched");
                return quotes;
            }
            Err(e) if instruments.len() == 1 => {
                warn!(instrument = %instruments[0], error = %e, "live quote failed");
                return HashMap::new();
            }
            Err(e) => {
                warn!(
                    requested = instruments.len(),
                    error = %e,
                    "batch quote failed, retrying instruments one at a time"
                );
            }
        }

        let mut quotes = HashMap::new();
        for instrument in instruments {
            match self
                .guarded_fetch(
                    "quotes",
                    self.source.fetch_quotes(std::slice::from_ref(instrument)),
                )
                .await
            {
                Ok(single) => quotes.extend(single),
                Err(e) => warn!(instrument = %instrument, error = %e, "live quote failed"),
            }
        }
        quotes
    }

    async fn persist(&self, quotes: &HashMap<Instrument, Quote>) {
        if quotes.is_empty() {
            return;
        }
        let cached: Vec<CachedPrice> = quotes.values().map(CachedPrice::from).collect();
        if let Err(e) = self.store.put_current_prices(&cached).await {
            warn!(count = cached.len(), error = %e, "failed to persist current prices");
        }
    }

    /// Space live calls by the minimum interval and bound them by the timeout.
    async fn guarded_fetch<T>(
        &self,
        what: &str,
        fetch: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.throttle().await;
        match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "{} {what} request timed out after {}",
                self.source.name(),
                format_duration(self.fetch_timeout)
            )),
        }
    }

    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_request_interval {
                tokio::time::sleep(self.min_request_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
