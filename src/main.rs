use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use holdbook::config::{default_config_path, ResolvedConfig};
use holdbook::currency::CurrencyService;
use holdbook::market_data::{
    FrankfurterRateSource, JsonlMarketDataStore, MarketDataStore, PriceService, YahooPriceSource,
};
use holdbook::models::{Country, DateRange};
use holdbook::portfolio::{
    Analytics, ImportRecord, Ledger, PriceMode, RealizedGainsCalculator, SnapshotEngine,
};
use holdbook::storage::{HoldingFilter, JsonFileStorage, Storage};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "holdbook")]
#[command(about = "Multi-currency investment portfolio tracker")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Log as JSON lines instead of text
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show current configuration
    Config,
    /// Value the portfolio on a date (default today) and store the snapshot
    Snapshot {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Create missing weekday snapshots over a date range
    Backfill {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Also fetch and store daily price history for active holdings
        #[arg(long)]
        prices: bool,
    },
    /// List gaps in the snapshot series
    Gaps {
        #[arg(long, default_value_t = 365)]
        days: i64,
    },
    /// Snapshots over the last N days
    History {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// FIFO realized gains
    RealizedGains {
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        country: Option<Country>,
        #[arg(long)]
        account: Option<String>,
    },
    /// Totals, gains and today's change
    Summary {
        /// Use stored prices only
        #[arg(long)]
        fast: bool,
    },
    /// Allocation by country, exchange and top holdings
    Allocation {
        #[arg(long)]
        fast: bool,
    },
    /// Best and worst holdings against average cost
    Performance {
        #[arg(long)]
        fast: bool,
    },
    /// Today's biggest movers
    Movers {
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Value by account type, tax-advantaged vs taxable
    Accounts {
        #[arg(long)]
        fast: bool,
    },
    /// Threshold-based recommendations and a health score
    Recommendations {
        /// Use live prices with day change
        #[arg(long)]
        live: bool,
    },
    /// Summary, movers and alerts in one report
    Briefing,
    /// Import transactions from a JSON array of records
    Import {
        file: PathBuf,
        /// Report what would change without writing
        #[arg(long)]
        preview: bool,
    },
    /// Recompute every holding's position from its ledger
    Rebuild,
}

struct Services {
    storage: Arc<dyn Storage>,
    prices: Arc<PriceService>,
    currency: Arc<CurrencyService>,
}

impl Services {
    fn new(config: &ResolvedConfig) -> Self {
        let storage: Arc<dyn Storage> = Arc::new(JsonFileStorage::new(&config.data_dir));
        let market: Arc<dyn MarketDataStore> =
            Arc::new(JsonlMarketDataStore::new(config.data_dir.join("market_data")));
        let prices = PriceService::new(market.clone(), Arc::new(YahooPriceSource::new()))
            .with_config(&config.config.prices);
        let currency = CurrencyService::from_config(
            market,
            Arc::new(FrankfurterRateSource::new()),
            &config.config.currency,
        );
        Self {
            storage,
            prices: Arc::new(prices),
            currency: Arc::new(currency),
        }
    }

    fn snapshots(&self, config: &ResolvedConfig) -> SnapshotEngine {
        SnapshotEngine::new(
            self.storage.clone(),
            self.prices.clone(),
            self.currency.clone(),
            config.base_currency(),
        )
        .with_gap_threshold(config.config.snapshots.gap_threshold_days)
    }

    fn analytics(&self, config: &ResolvedConfig) -> Analytics {
        Analytics::new(
            self.storage.clone(),
            self.prices.clone(),
            self.currency.clone(),
            config.base_currency(),
        )
        .with_thresholds(config.config.recommendations.clone())
    }
}

fn mode(fast: bool) -> PriceMode {
    if fast {
        PriceMode::Fast
    } else {
        PriceMode::Live
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .init();
    } else {
        tracing_subscriber::registry().with(filter).with(layer).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = ResolvedConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load holdbook config: {}", cli.config.display()))?;
    let services = Services::new(&config);
    let today = Utc::now().date_naive();

    match cli.command {
        Command::Config => {
            println!("Config file: {}", cli.config.display());
            println!("Data directory: {}", config.data_dir.display());
            print!("{}", toml::to_string_pretty(&config.config)?);
        }
        Command::Snapshot { date } => {
            let outcome = services
                .snapshots(&config)
                .create_snapshot(date.unwrap_or(today))
                .await?;
            print_json(&outcome)?;
        }
        Command::Backfill { start, end, prices } => {
            let end = end.unwrap_or(today);
            if prices {
                let holdings = services
                    .storage
                    .list_active_holdings(&HoldingFilter::all())
                    .await?;
                let instruments: Vec<_> = holdings
                    .iter()
                    .filter(|h| !h.is_constant_value())
                    .map(|h| h.instrument())
                    .collect();
                let created = services.prices.backfill_history(&instruments, start, end).await?;
                eprintln!("Stored {created} new price bars");
            }
            let report = services.snapshots(&config).backfill(start, end).await?;
            print_json(&report)?;
        }
        Command::Gaps { days } => {
            let range = DateRange::between(today - Duration::days(days), today);
            print_json(&services.snapshots(&config).gaps(&range).await?)?;
        }
        Command::History { days } => {
            print_json(&services.snapshots(&config).history(days, None).await?)?;
        }
        Command::RealizedGains {
            year,
            country,
            account,
        } => {
            let filter = HoldingFilter {
                country,
                exchange: None,
                account,
            };
            let report = RealizedGainsCalculator::new(
                services.storage.clone(),
                services.currency.clone(),
                config.base_currency(),
            )
            .report(&filter, year)
            .await?;
            print_json(&report)?;
        }
        Command::Summary { fast } => {
            print_json(&services.analytics(&config).summary(mode(fast)).await?)?;
        }
        Command::Allocation { fast } => {
            print_json(&services.analytics(&config).allocation(mode(fast)).await?)?;
        }
        Command::Performance { fast } => {
            print_json(&services.analytics(&config).performance(mode(fast)).await?)?;
        }
        Command::Movers { limit } => {
            print_json(&services.analytics(&config).daily_movers(limit).await?)?;
        }
        Command::Accounts { fast } => {
            print_json(&services.analytics(&config).account_breakdown(mode(fast)).await?)?;
        }
        Command::Recommendations { live } => {
            print_json(&services.analytics(&config).recommendations(mode(!live)).await?)?;
        }
        Command::Briefing => {
            print_json(&services.analytics(&config).briefing().await?)?;
        }
        Command::Import { file, preview } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let records: Vec<ImportRecord> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            let ledger = Ledger::new(services.storage.clone());
            if preview {
                print_json(&ledger.preview_import(&records).await?)?;
            } else {
                print_json(&ledger.import(records).await?)?;
            }
        }
        Command::Rebuild => {
            let count = Ledger::new(services.storage.clone()).rebuild_all().await?;
            println!("Rebuilt {count} holdings");
        }
    }

    Ok(())
}
