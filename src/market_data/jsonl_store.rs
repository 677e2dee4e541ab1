use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;

use super::store::tolerance_floor;
use super::{CachedPrice, ExchangeRate, Instrument, MarketDataStore, PriceBar};

/// Market data on disk:
///
/// ```text
/// prices/<SYMBOL>-<EXCHANGE>/<year>.jsonl
/// fx/<FROM>-<TO>/<year>.jsonl
/// current_prices.json
/// ```
pub struct JsonlMarketDataStore {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlMarketDataStore {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn prices_dir(&self, instrument: &Instrument) -> PathBuf {
        self.base_path.join("prices").join(instrument.storage_key())
    }

    fn price_file(&self, instrument: &Instrument, year: i32) -> PathBuf {
        self.prices_dir(instrument).join(format!("{year:04}.jsonl"))
    }

    fn fx_file(&self, from: &str, to: &str, year: i32) -> PathBuf {
        let pair = format!("{}-{}", sanitize_code(from), sanitize_code(to));
        self.base_path
            .join("fx")
            .join(pair)
            .join(format!("{year:04}.jsonl"))
    }

    fn current_prices_file(&self) -> PathBuf {
        self.base_path.join("current_prices.json")
    }

    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create directory")?;
        }
        Ok(())
    }

    async fn read_jsonl<T: for<'de> serde::Deserialize<'de>>(&self, path: &Path) -> Result<Vec<T>> {
        let file = match fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to open file"),
        };

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut items = Vec::new();

        while let Some(line) = lines.next_line().await.context("Failed to read line")? {
            if line.trim().is_empty() {
                continue;
            }
            let item: T = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse JSONL line: {line}"))?;
            items.push(item);
        }

        Ok(items)
    }

    async fn write_jsonl<T: serde::Serialize>(&self, path: &Path, items: &[T]) -> Result<()> {
        self.ensure_dir(path).await?;

        let mut content = String::new();
        for item in items {
            let line = serde_json::to_string(item).context("Failed to serialize item")?;
            content.push_str(&line);
            content.push('\n');
        }

        fs::write(path, content)
            .await
            .context("Failed to write JSONL file")?;
        Ok(())
    }

    async fn read_current_prices(&self) -> Result<Vec<CachedPrice>> {
        let path = self.current_prices_file();
        match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).context("Failed to read current prices"),
        }
    }
}

#[async_trait::async_trait]
impl MarketDataStore for JsonlMarketDataStore {
    async fn get_bar(&self, instrument: &Instrument, date: NaiveDate) -> Result<Option<PriceBar>> {
        let bars: Vec<PriceBar> = self
            .read_jsonl(&self.price_file(instrument, date.year()))
            .await?;
        Ok(bars.into_iter().find(|bar| bar.date == date))
    }

    async fn latest_bar_on_or_before(
        &self,
        instrument: &Instrument,
        date: NaiveDate,
        tolerance_days: u32,
    ) -> Result<Option<PriceBar>> {
        let floor = tolerance_floor(date, tolerance_days);
        let mut best: Option<PriceBar> = None;
        // The window may straddle a year boundary.
        for year in floor.year()..=date.year() {
            let bars: Vec<PriceBar> = self.read_jsonl(&self.price_file(instrument, year)).await?;
            for bar in bars {
                if bar.date < floor || bar.date > date {
                    continue;
                }
                if best.as_ref().is_none_or(|b| bar.date > b.date) {
                    best = Some(bar);
                }
            }
        }
        Ok(best)
    }

    async fn put_bars(&self, bars: &[PriceBar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;

        let mut grouped: BTreeMap<(Instrument, i32), Vec<&PriceBar>> = BTreeMap::new();
        for bar in bars {
            grouped
                .entry((bar.instrument.clone(), bar.date.year()))
                .or_default()
                .push(bar);
        }

        let mut inserted = 0;
        for ((instrument, year), items) in grouped {
            let path = self.price_file(&instrument, year);
            let existing: Vec<PriceBar> = self.read_jsonl(&path).await?;
            let mut by_date: BTreeMap<NaiveDate, PriceBar> =
                existing.into_iter().map(|bar| (bar.date, bar)).collect();
            let before = by_date.len();
            for bar in items {
                by_date.entry(bar.date).or_insert_with(|| bar.clone());
            }
            if by_date.len() == before {
                continue;
            }
            inserted += by_date.len() - before;
            let sorted: Vec<PriceBar> = by_date.into_values().collect();
            self.write_jsonl(&path, &sorted).await?;
        }

        Ok(inserted)
    }

    async fn get_current_price(&self, instrument: &Instrument) -> Result<Option<CachedPrice>> {
        Ok(self
            .read_current_prices()
            .await?
            .into_iter()
            .find(|price| &price.instrument == instrument))
    }

    async fn put_current_prices(&self, prices: &[CachedPrice]) -> Result<()> {
        if prices.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;

        let mut merged: BTreeMap<Instrument, CachedPrice> = self
            .read_current_prices()
            .await?
            .into_iter()
            .map(|price| (price.instrument.clone(), price))
            .collect();
        for price in prices {
            merged.insert(price.instrument.clone(), price.clone());
        }

        let path = self.current_prices_file();
        self.ensure_dir(&path).await?;
        let values: Vec<CachedPrice> = merged.into_values().collect();
        let json =
            serde_json::to_string_pretty(&values).context("Failed to serialize current prices")?;
        fs::write(&path, json)
            .await
            .context("Failed to write current prices")?;
        Ok(())
    }

    async fn get_rate(
        &self,
        from: &str,
        to: &str,
        date: NaiveDate,
    ) -> Result<Option<ExchangeRate>> {
        let rates: Vec<ExchangeRate> = self.read_jsonl(&self.fx_file(from, to, date.year())).await?;
        Ok(rates.into_iter().rev().find(|rate| rate.date == date))
    }

    async fn put_rate(&self, rate: &ExchangeRate) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let path = self.fx_file(&rate.from, &rate.to, rate.date.year());
        let mut rates: Vec<ExchangeRate> = self.read_jsonl(&path).await?;
        rates.retain(|existing| existing.date != rate.date);
        rates.push(rate.clone());
        rates.sort_by_key(|r| r.date);
        self.write_jsonl(&path, &rates).await
    }
}

fn sanitize_code(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .to_uppercase()
}
