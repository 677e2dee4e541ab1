pub mod frankfurter;
pub mod yahoo;

pub use frankfurter::FrankfurterRateSource;
pub use yahoo::YahooPriceSource;
