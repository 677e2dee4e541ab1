//! Frankfurter FX rate provider using ECB daily reference rates.
//!
//! ECB publishes rates with EUR as the base currency, so any other pair is
//! computed as a cross rate through EUR.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::market_data::{ExchangeRate, FxRateSource};

const FRANKFURTER_BASE_URL: &str = "https://api.frankfurter.app";

#[derive(Debug, Deserialize)]
struct FrankfurterResponse {
    date: NaiveDate,
    rates: HashMap<String, f64>,
}

/// Frankfurter FX rate provider. No API key is required.
#[derive(Debug, Clone)]
pub struct FrankfurterRateSource {
    client: Client,
    base_url: String,
}

impl FrankfurterRateSource {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            base_url: FRANKFURTER_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// EUR-based rates for `currencies` on `date` (or the last ECB publication before it).
    async fn fetch_eur_rates(
        &self,
        currencies: &[&str],
        date: NaiveDate,
    ) -> Result<(NaiveDate, HashMap<String, Decimal>)> {
        let symbols = currencies.join(",");
        let url = format!("{}/{date}?from=EUR&to={symbols}", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<FrankfurterResponse>()
            .await
            .context("Failed to parse Frankfurter response")?;

        let mut rates = HashMap::with_capacity(response.rates.len());
        for (code, rate) in response.rates {
            let rate = Decimal::try_from(rate)
                .with_context(|| format!("Invalid rate {rate} for {code}"))?;
            rates.insert(code, rate.normalize());
        }
        Ok((response.date, rates))
    }

    fn lookup(rates: &HashMap<String, Decimal>, code: &str) -> Result<Decimal> {
        rates
            .get(code)
            .copied()
            .filter(|rate| !rate.is_zero())
            .ok_or_else(|| anyhow!("Currency {code} not found in response"))
    }

    /// from/to = (EUR/to) / (EUR/from).
    fn compute_cross_rate(eur_to_from: Decimal, eur_to_to: Decimal) -> Result<Decimal> {
        eur_to_to
            .checked_div(eur_to_from)
            .ok_or_else(|| anyhow!("Cross rate overflow"))
    }
}

impl Default for FrankfurterRateSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FxRateSource for FrankfurterRateSource {
    async fn fetch_close(
        &self,
        from: &str,
        to: &str,
        date: NaiveDate,
    ) -> Result<Option<ExchangeRate>> {
        let from = from.trim().to_uppercase();
        let to = to.trim().to_uppercase();

        if from == to {
            return Ok(Some(ExchangeRate {
                from,
                to,
                date,
                rate: Decimal::ONE,
                source: "frankfurter".to_string(),
            }));
        }

        let rate = if from == "EUR" {
            let (_, rates) = self.fetch_eur_rates(&[&to], date).await?;
            Self::lookup(&rates, &to)?
        } else if to == "EUR" {
            let (_, rates) = self.fetch_eur_rates(&[&from], date).await?;
            Self::compute_cross_rate(Self::lookup(&rates, &from)?, Decimal::ONE)?
        } else {
            let (_, rates) = self.fetch_eur_rates(&[&from, &to], date).await?;
            Self::compute_cross_rate(Self::lookup(&rates, &from)?, Self::lookup(&rates, &to)?)?
        };

        Ok(Some(ExchangeRate {
            from,
            to,
            date,
            rate: rate.round_dp(8).normalize(),
            source: "frankfurter".to_string(),
        }))
    }

    fn name(&self) -> &str {
        "frankfurter"
    }
}
