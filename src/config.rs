use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::duration::{deserialize_duration, serialize_duration};

/// Reporting currency. Every aggregate is expressed in it.
fn default_base_currency() -> String {
    "CAD".to_string()
}

fn default_quote_ttl() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_min_request_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_price_fetch_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_rate_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_rate_fetch_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Slow-moving pairs that are served without a live lookup, keyed "FROM:TO".
pub fn default_fallback_rates() -> BTreeMap<String, Decimal> {
    [
        ("USD:CAD", Decimal::new(137, 2)),
        ("CAD:USD", Decimal::new(73, 2)),
        ("INR:CAD", Decimal::new(151, 4)),
        ("CAD:INR", Decimal::new(662, 1)),
        ("USD:INR", Decimal::new(86, 0)),
        ("INR:USD", Decimal::new(12, 3)),
    ]
    .into_iter()
    .map(|(pair, rate)| (pair.to_string(), rate))
    .collect()
}

/// Price adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceConfig {
    /// How long a fetched quote is served from memory.
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub quote_ttl: Duration,

    /// Minimum spacing between two live calls to the price source.
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub min_request_interval: Duration,

    /// Upper bound on a single live call. Expiry counts as "unavailable".
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub fetch_timeout: Duration,

    /// Stored history older than this many days is not used for a past date.
    pub history_tolerance_days: u32,

    /// Half-width of the window requested from the live source for a past date.
    pub live_window_days: u32,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            quote_ttl: default_quote_ttl(),
            min_request_interval: default_min_request_interval(),
            fetch_timeout: default_price_fetch_timeout(),
            history_tolerance_days: 5,
            live_window_days: 7,
        }
    }
}

/// Currency adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrencyConfig {
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub rate_ttl: Duration,

    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub fetch_timeout: Duration,

    /// Static table consulted before any live lookup.
    pub fallback_rates: BTreeMap<String, Decimal>,
}

impl Default for CurrencyConfig {
    fn default() -> Self {
        Self {
            rate_ttl: default_rate_ttl(),
            fetch_timeout: default_rate_fetch_timeout(),
            fallback_rates: default_fallback_rates(),
        }
    }
}

impl CurrencyConfig {
    /// Fallback table as `(from, to) -> rate`. Malformed keys are skipped.
    pub fn fallback_pairs(&self) -> Vec<((String, String), Decimal)> {
        self.fallback_rates
            .iter()
            .filter_map(|(pair, rate)| {
                let (from, to) = pair.split_once(':')?;
                let from = from.trim().to_uppercase();
                let to = to.trim().to_uppercase();
                if from.is_empty() || to.is_empty() {
                    return None;
                }
                Some(((from, to), *rate))
            })
            .collect()
    }
}

/// Snapshot engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Consecutive snapshots further apart than this are reported as a gap.
    pub gap_threshold_days: i64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            gap_threshold_days: 5,
        }
    }
}

/// Thresholds for recommendations and briefing alerts. All values are percentages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendationConfig {
    pub take_profit_pct: Decimal,
    pub take_profit_high_pct: Decimal,
    pub review_loss_pct: Decimal,
    pub review_loss_high_pct: Decimal,
    pub max_position_pct: Decimal,
    pub max_position_high_pct: Decimal,
    pub watch_day_change_pct: Decimal,
    pub max_country_pct: Decimal,
    pub concentration_alert_pct: Decimal,
    pub daily_loss_alert_pct: Decimal,
    pub underwater_alert_pct: Decimal,
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            take_profit_pct: Decimal::from(40),
            take_profit_high_pct: Decimal::from(80),
            review_loss_pct: Decimal::from(-20),
            review_loss_high_pct: Decimal::from(-40),
            max_position_pct: Decimal::from(12),
            max_position_high_pct: Decimal::from(20),
            watch_day_change_pct: Decimal::from(3),
            max_country_pct: Decimal::from(70),
            concentration_alert_pct: Decimal::from(15),
            daily_loss_alert_pct: Decimal::from(-5),
            underwater_alert_pct: Decimal::from(-20),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to data directory. If relative, resolved from config file location.
    /// If not specified, defaults to the config file's directory.
    pub data_dir: Option<PathBuf>,

    #[serde(default = "default_base_currency")]
    pub base_currency: String,

    pub prices: PriceConfig,
    pub currency: CurrencyConfig,
    pub snapshots: SnapshotConfig,
    pub recommendations: RecommendationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            base_currency: default_base_currency(),
            prices: PriceConfig::default(),
            currency: CurrencyConfig::default(),
            snapshots: SnapshotConfig::default(),
            recommendations: RecommendationConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.base_currency = config.base_currency.trim().to_uppercase();

        Ok(config)
    }

    /// Load config from a file, or return default config if file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// If `data_dir` is set and relative, it's resolved relative to `config_dir`.
    pub fn resolve_data_dir(&self, config_dir: &Path) -> PathBuf {
        match &self.data_dir {
            Some(data_dir) if data_dir.is_absolute() => data_dir.clone(),
            Some(data_dir) => config_dir.join(data_dir),
            None => config_dir.to_path_buf(),
        }
    }
}

/// Loaded configuration with resolved paths.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub data_dir: PathBuf,
    pub config: Config,
}

/// Returns the default config file path.
///
/// Resolution order:
/// 1. `./holdbook.toml` if it exists in current directory
/// 2. `~/.local/share/holdbook/holdbook.toml` (XDG data directory)
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from("holdbook.toml");
    if local_config.exists() {
        return local_config;
    }

    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("holdbook").join("holdbook.toml");
    }

    local_config
}

impl ResolvedConfig {
    /// The data directory is resolved relative to the config file's parent directory.
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_path = config_path
            .canonicalize()
            .with_context(|| format!("Config file not found: {}", config_path.display()))?;

        let config_dir = config_path
            .parent()
            .context("Config file has no parent directory")?;

        let config = Config::load(&config_path)?;
        let data_dir = config.resolve_data_dir(config_dir);

        Ok(Self { data_dir, config })
    }

    /// When the file is missing, defaults apply and the file's intended
    /// directory becomes the data directory.
    pub fn load_or_default(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            return Self::load(config_path);
        }

        let config_path = if config_path.is_relative() {
            std::env::current_dir()
                .context("Failed to get current directory")?
                .join(config_path)
        } else {
            config_path.to_path_buf()
        };

        let config_dir = config_path
            .parent()
            .context("Config path has no parent directory")?;

        Ok(Self {
            data_dir: config_dir.to_path_buf(),
            config: Config::default(),
        })
    }

    pub fn base_currency(&self) -> &str {
        &self.config.base_currency
    }
}
