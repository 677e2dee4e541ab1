//! Currency conversion with tiered rate resolution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::TtlCache;
use crate::clock::{Clock, SystemClock};
use crate::config::CurrencyConfig;
use crate::market_data::{FxRateSource, MarketDataStore};

type RateKey = (String, String, NaiveDate);

/// Result of a conversion that never fails: without a rate the original
/// amount is kept and `warning` says so.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversion {
    pub amount: Decimal,
    pub rate: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl Conversion {
    pub fn is_converted(&self) -> bool {
        self.rate.is_some()
    }
}

/// Resolves `from -> to` rates, in order: in-memory cache, stored daily
/// rates, the static fallback table, then the live source. Live results are
/// written back to the store.
pub struct CurrencyService {
    store: Arc<dyn MarketDataStore>,
    source: Arc<dyn FxRateSource>,
    cache: TtlCache<RateKey, Decimal>,
    fallback: HashMap<(String, String), Decimal>,
    fetch_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl CurrencyService {
    pub fn new(store: Arc<dyn MarketDataStore>, source: Arc<dyn FxRateSource>) -> Self {
        Self::from_config(store, source, &CurrencyConfig::default())
    }

    pub fn from_config(
        store: Arc<dyn MarketDataStore>,
        source: Arc<dyn FxRateSource>,
        config: &CurrencyConfig,
    ) -> Self {
        Self {
            store,
            source,
            cache: TtlCache::new(config.rate_ttl),
            fallback: config.fallback_pairs().into_iter().collect(),
            fetch_timeout: config.fetch_timeout,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.cache = self.cache.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Units of `to` per unit of `from` on `as_of`. Identical currencies are exactly 1.
    pub async fn rate(&self, from: &str, to: &str, as_of: NaiveDate) -> Option<Decimal> {
        let from = from.trim().to_uppercase();
        let to = to.trim().to_uppercase();
        if from == to {
            return Some(Decimal::ONE);
        }

        let key = (from.clone(), to.clone(), as_of);
        if let Some(rate) = self.cache.get(&key).await {
            return Some(rate);
        }

        match self.store.get_rate(&from, &to, as_of).await {
            Ok(Some(stored)) => {
                debug!(from = %from, to = %to, date = %as_of, rate = %stored.rate, "rate found in store");
                self.cache.insert(key, stored.rate).await;
                return Some(stored.rate);
            }
            Ok(None) => {}
            Err(e) => warn!(from = %from, to = %to, error = %e, "failed to read stored rate"),
        }

        if let Some(rate) = self.fallback.get(&(from.clone(), to.clone())).copied() {
            debug!(from = %from, to = %to, rate = %rate, "using fallback rate");
            self.cache.insert(key, rate).await;
            return Some(rate);
        }

        let fetched =
            tokio::time::timeout(self.fetch_timeout, self.source.fetch_close(&from, &to, as_of))
                .await;
        match fetched {
            Ok(Ok(Some(rate))) => {
                info!(
                    from = %from,
                    to = %to,
                    date = %as_of,
                    rate = %rate.rate,
                    source = %rate.source,
                    "rate fetched"
                );
                if let Err(e) = self.store.put_rate(&rate).await {
                    warn!(from = %from, to = %to, error = %e, "failed to persist rate");
                }
                self.cache.insert(key, rate.rate).await;
                Some(rate.rate)
            }
            Ok(Ok(None)) => {
                warn!(from = %from, to = %to, date = %as_of, "no rate available");
                None
            }
            Ok(Err(e)) => {
                warn!(from = %from, to = %to, date = %as_of, error = %e, "rate lookup failed");
                None
            }
            Err(_) => {
                warn!(from = %from, to = %to, date = %as_of, "rate lookup timed out");
                None
            }
        }
    }

    pub async fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
        as_of: NaiveDate,
    ) -> Option<Decimal> {
        self.rate(from, to, as_of).await.map(|rate| amount * rate)
    }

    /// Convert, or keep `amount` unchanged with a warning when no rate exists.
    pub async fn convert_or_original(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
        as_of: NaiveDate,
    ) -> Conversion {
        match self.rate(from, to, as_of).await {
            Some(rate) => Conversion {
                amount: amount * rate,
                rate: Some(rate),
                warning: None,
            },
            None => Conversion {
                amount,
                rate: None,
                warning: Some(format!(
                    "no {}->{} rate for {as_of}; amount left in {}",
                    from.to_uppercase(),
                    to.to_uppercase(),
                    from.to_uppercase()
                )),
            },
        }
    }
}
