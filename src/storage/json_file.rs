use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

use super::{SnapshotConflict, Storage};
use crate::models::{DateRange, Holding, Id, ManualValuation, PortfolioSnapshot, Transaction};

/// JSON file-based storage implementation.
///
/// Directory structure:
/// ```text
/// data/
///   holdings/
///     {id}/
///       holding.json
///       transactions.jsonl
///       valuations.jsonl
///   snapshots/
///     {YYYY-MM-DD}.json
/// ```
pub struct JsonFileStorage {
    base_path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn holdings_dir(&self) -> PathBuf {
        self.base_path.join("holdings")
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.base_path.join("snapshots")
    }

    fn holding_dir(&self, id: &Id) -> Result<PathBuf> {
        if !Id::is_path_safe(id.as_str()) {
            anyhow::bail!("Refusing unsafe holding id {:?}", id.as_str());
        }
        Ok(self.holdings_dir().join(id.as_str()))
    }

    fn holding_file(&self, id: &Id) -> Result<PathBuf> {
        Ok(self.holding_dir(id)?.join("holding.json"))
    }

    fn transactions_file(&self, id: &Id) -> Result<PathBuf> {
        Ok(self.holding_dir(id)?.join("transactions.jsonl"))
    }

    fn valuations_file(&self, id: &Id) -> Result<PathBuf> {
        Ok(self.holding_dir(id)?.join("valuations.jsonl"))
    }

    fn snapshot_file(&self, date: NaiveDate) -> PathBuf {
        self.snapshots_dir().join(format!("{date}.json"))
    }

    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create directory")?;
        }
        Ok(())
    }

    async fn read_json<T: for<'de> serde::Deserialize<'de>>(&self, path: &Path) -> Result<Option<T>> {
        match fs::read_to_string(path).await {
            Ok(content) => {
                let value = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse JSON from {}", path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to read file"),
        }
    }

    async fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        self.ensure_dir(path).await?;
        let content = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
        fs::write(path, content)
            .await
            .context("Failed to write file")?;
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

    async fn append_jsonl<T: serde::Serialize>(&self, path: &Path, items: &[T]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        self.ensure_dir(path).await?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .context("Failed to open file for append")?;

        for item in items {
            let line = serde_json::to_string(item).context("Failed to serialize item")?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }

        Ok(())
    }

    async fn list_holding_ids(&self) -> Result<Vec<Id>> {
        let mut ids = Vec::new();

        let mut entries = match fs::read_dir(self.holdings_dir()).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e).context("Failed to read directory"),
        };

        while let Some(entry) = entries.next_entry().await.context("Failed to read entry")? {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match Id::parse(name) {
                Ok(id) => ids.push(id),
                Err(e) => warn!(error = %e, "skipping holding directory"),
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn list_snapshot_dates(&self) -> Result<Vec<NaiveDate>> {
        let mut dates = Vec::new();

        let mut entries = match fs::read_dir(self.snapshots_dir()).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dates),
            Err(e) => return Err(e).context("Failed to read snapshots directory"),
        };

        while let Some(entry) = entries.next_entry().await.context("Failed to read entry")? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
            match parsed {
                Some(date) => dates.push(date),
                None => warn!(path = %path.display(), "skipping unrecognised snapshot file"),
            }
        }

        dates.sort();
        Ok(dates)
    }
}

#[async_trait::async_trait]
impl Storage for JsonFileStorage {
    async fn list_holdings(&self) -> Result<Vec<Holding>> {
        let mut holdings = Vec::new();
        for id in self.list_holding_ids().await? {
            match self.get_holding(&id).await? {
                Some(holding) if holding.id == id => holdings.push(holding),
                Some(holding) => warn!(
                    dir = %id,
                    id = %holding.id,
                    "holding id does not match its directory, skipping"
                ),
                None => {}
            }
        }
        Ok(holdings)
    }

    async fn get_holding(&self, id: &Id) -> Result<Option<Holding>> {
        self.read_json(&self.holding_file(id)?).await
    }

    async fn save_holding(&self, holding: &Holding) -> Result<()> {
        self.write_json(&self.holding_file(&holding.id)?, holding).await
    }

    async fn get_transactions(&self, holding_id: &Id) -> Result<Vec<Transaction>> {
        self.read_jsonl(&self.transactions_file(holding_id)?).await
    }

    async fn append_transactions(&self, holding_id: &Id, txns: &[Transaction]) -> Result<()> {
        self.append_jsonl(&self.transactions_file(holding_id)?, txns)
            .await
    }

    async fn get_snapshot(&self, date: NaiveDate) -> Result<Option<PortfolioSnapshot>> {
        self.read_json(&self.snapshot_file(date)).await
    }

    async fn insert_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        let path = self.snapshot_file(snapshot.date);
        self.ensure_dir(&path).await?;
        let content =
            serde_json::to_string_pretty(snapshot).context("Failed to serialize snapshot")?;

        // create_new makes the date check and the insert one step.
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(SnapshotConflict {
                    date: snapshot.date,
                }
                .into());
            }
            Err(e) => return Err(e).context("Failed to create snapshot file"),
        };
        file.write_all(content.as_bytes())
            .await
            .context("Failed to write snapshot")?;
        file.flush().await?;
        Ok(())
    }

    async fn update_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<bool> {
        let path = self.snapshot_file(snapshot.date);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(false);
        }
        self.write_json(&path, snapshot).await?;
        Ok(true)
    }

    async fn list_snapshots(&self, range: &DateRange) -> Result<Vec<PortfolioSnapshot>> {
        let mut snapshots = Vec::new();
        for date in self.list_snapshot_dates().await? {
            if !range.contains(date) {
                continue;
            }
            if let Some(snapshot) = self.get_snapshot(date).await? {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    async fn delete_snapshots(&self, range: &DateRange) -> Result<usize> {
        let mut deleted = 0;
        for date in self.list_snapshot_dates().await? {
            if !range.contains(date) {
                continue;
            }
            match fs::remove_file(self.snapshot_file(date)).await {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).context("Failed to delete snapshot"),
            }
        }
        Ok(deleted)
    }

    async fn save_manual_valuation(&self, valuation: &ManualValuation) -> Result<()> {
        self.append_jsonl(&self.valuations_file(&valuation.holding_id)?, std::slice::from_ref(valuation))
            .await
    }

    async fn manual_valuation_on_or_before(
        &self,
        holding_id: &Id,
        date: NaiveDate,
    ) -> Result<Option<ManualValuation>> {
        let valuations: Vec<ManualValuation> =
            self.read_jsonl(&self.valuations_file(holding_id)?).await?;
        // Later lines win for the same date.
        Ok(valuations
            .into_iter()
            .enumerate()
            .filter(|(_, v)| v.date <= date)
            .max_by_key(|(index, v)| (v.date, *index))
            .map(|(_, v)| v))
    }
}
