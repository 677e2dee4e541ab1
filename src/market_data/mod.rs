mod instrument;
mod jsonl_store;
mod models;
#[cfg(feature = "market_data")]
pub mod providers;
mod service;
mod sources;
mod store;

pub use instrument::Instrument;
pub use jsonl_store::JsonlMarketDataStore;
pub use models::{CachedPrice, ExchangeRate, PriceBar, PriceChange, Quote};
pub use service::PriceService;
pub use sources::{FxRateSource, NoopSource, PriceSource};
pub use store::{MarketDataStore, MemoryMarketDataStore};

#[cfg(feature = "market_data")]
pub use providers::{FrankfurterRateSource, YahooPriceSource};
