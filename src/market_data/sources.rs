use std::collections::HashMap;

use anyhow::Result;
use chrono::NaiveDate;

use super::{ExchangeRate, Instrument, PriceBar, Quote};

/// Live quotes and daily history for listed instruments.
#[async_trait::async_trait]
pub trait PriceSource: Send + Sync {
    /// Latest quote for each instrument the source knows about. Unknown
    /// instruments are simply absent from the map.
    async fn fetch_quotes(&self, instruments: &[Instrument]) -> Result<HashMap<Instrument, Quote>>;

    /// Daily bars in `[start, end]`, ascending by date.
    async fn fetch_history(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>>;

    fn name(&self) -> &str;
}

/// Daily currency conversion rates.
#[async_trait::async_trait]
pub trait FxRateSource: Send + Sync {
    async fn fetch_close(&self, from: &str, to: &str, date: NaiveDate)
        -> Result<Option<ExchangeRate>>;

    fn name(&self) -> &str;
}

/// Source with no data, for offline use.
pub struct NoopSource;

#[async_trait::async_trait]
impl PriceSource for NoopSource {
    async fn fetch_quotes(&self, _instruments: &[Instrument]) -> Result<HashMap<Instrument, Quote>> {
        Ok(HashMap::new())
    }

    async fn fetch_history(
        &self,
        _instrument: &Instrument,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

#[async_trait::async_trait]
impl FxRateSource for NoopSource {
    async fn fetch_close(
        &self,
        _from: &str,
        _to: &str,
        _date: NaiveDate,
    ) -> Result<Option<ExchangeRate>> {
        Ok(None)
    }

    fn name(&self) -> &str {
        "noop"
    }
}
