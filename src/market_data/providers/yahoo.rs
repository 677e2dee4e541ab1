//! Yahoo Finance price provider.
//!
//! Quotes come from the batched `v7/finance/quote` endpoint, daily history
//! from `v8/finance/chart`. Yahoo identifies non-US listings by a ticker
//! suffix, e.g. `XEQT.TO` for the Toronto Stock Exchange.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::market_data::{Instrument, PriceBar, PriceSource, Quote};

const YAHOO_BASE_URL: &str = "https://query1.finance.yahoo.com";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) holdbook";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteEnvelope {
    quote_response: QuoteResponse,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    #[serde(default)]
    result: Vec<QuoteResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResult {
    symbol: String,
    regular_market_price: Option<f64>,
    regular_market_previous_close: Option<f64>,
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartResponse,
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: ChartIndicators,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    #[serde(default)]
    gmtoffset: i64,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<ChartSeries>,
}

#[derive(Debug, Default, Deserialize)]
struct ChartSeries {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

/// Yahoo Finance provider. No API key is required.
#[derive(Debug, Clone)]
pub struct YahooPriceSource {
    client: Client,
    base_url: String,
}

impl YahooPriceSource {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            base_url: YAHOO_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Ticker suffix Yahoo uses for an exchange.
    pub fn exchange_suffix(exchange: &str) -> &'static str {
        match exchange.trim().to_uppercase().as_str() {
            "TSX" | "XTSE" => ".TO",
            "TSX-V" | "TSXV" | "XTSX" => ".V",
            "NSE" | "XNSE" => ".NS",
            "BSE" | "XBOM" => ".BO",
            _ => "",
        }
    }

    pub fn yahoo_symbol(instrument: &Instrument) -> String {
        format!(
            "{}{}",
            instrument.symbol,
            Self::exchange_suffix(&instrument.exchange)
        )
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        self.client
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?
            .error_for_status()?
            .json::<T>()
            .await
            .context("Failed to parse Yahoo response")
    }
}

impl Default for YahooPriceSource {
    fn default() -> Self {
        Self::new()
    }
}

fn to_decimal(value: Option<f64>) -> Option<Decimal> {
    value
        .filter(|v| v.is_finite())
        .and_then(|v| Decimal::try_from(v).ok())
        .map(|d| d.round_dp(6).normalize())
}

fn at(values: &[Option<f64>], index: usize) -> Option<Decimal> {
    to_decimal(values.get(index).copied().flatten())
}

#[async_trait::async_trait]
impl PriceSource for YahooPriceSource {
    async fn fetch_quotes(&self, instruments: &[Instrument]) -> Result<HashMap<Instrument, Quote>> {
        if instruments.is_empty() {
            return Ok(HashMap::new());
        }

        let by_symbol: HashMap<String, &Instrument> = instruments
            .iter()
            .map(|i| (Self::yahoo_symbol(i), i))
            .collect();
        let mut symbols: Vec<&str> = by_symbol.keys().map(String::as_str).collect();
        symbols.sort_unstable();
        let url = format!(
            "{}/v7/finance/quote?symbols={}",
            self.base_url,
            symbols.join(",")
        );

        let envelope: QuoteEnvelope = self.get_json(&url).await?;
        let fetched_at = Utc::now();
        let mut quotes = HashMap::new();
        for result in envelope.quote_response.result {
            let Some(instrument) = by_symbol.get(&result.symbol) else {
                debug!(symbol = %result.symbol, "ignoring unrequested symbol in quote response");
                continue;
            };
            let Some(price) = to_decimal(result.regular_market_price) else {
                debug!(symbol = %result.symbol, "quote without a market price");
                continue;
            };
            quotes.insert(
                (*instrument).clone(),
                Quote {
                    instrument: (*instrument).clone(),
                    price,
                    previous_close: to_decimal(result.regular_market_previous_close),
                    currency: result.currency,
                    fetched_at,
                },
            );
        }
        Ok(quotes)
    }

    async fn fetch_history(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        let period1 = start.and_time(NaiveTime::MIN).and_utc().timestamp();
        // period2 is exclusive
        let period2 = (end + chrono::Duration::days(1))
            .and_time(NaiveTime::MIN)
            .and_utc()
            .timestamp();
        let url = format!(
            "{}/v8/finance/chart/{}?period1={period1}&period2={period2}&interval=1d",
            self.base_url,
            Self::yahoo_symbol(instrument)
        );

        let envelope: ChartEnvelope = self.get_json(&url).await?;
        let Some(result) = envelope.chart.result.and_then(|r| r.into_iter().next()) else {
            return Ok(Vec::new());
        };
        let series = result.indicators.quote.into_iter().next().unwrap_or_default();

        let mut bars: Vec<PriceBar> = Vec::with_capacity(result.timestamp.len());
        for (index, ts) in result.timestamp.iter().enumerate() {
            let Some(close) = at(&series.close, index) else {
                continue;
            };
            let Some(local) = DateTime::<Utc>::from_timestamp(ts + result.meta.gmtoffset, 0) else {
                continue;
            };
            let date = local.date_naive();
            if date < start || date > end {
                continue;
            }
            bars.push(PriceBar {
                instrument: instrument.clone(),
                date,
                open: at(&series.open, index),
                high: at(&series.high, index),
                low: at(&series.low, index),
                close,
                volume: series.volume.get(index).copied().flatten(),
                source: self.name().to_string(),
            });
        }
        bars.sort_by_key(|bar| bar.date);
        bars.dedup_by_key(|bar| bar.date);
        Ok(bars)
    }

    fn name(&self) -> &str {
        "yahoo"
    }
}
