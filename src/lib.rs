pub mod cache;
pub mod clock;
pub mod config;
pub mod currency;
pub mod duration;
pub mod market_data;
pub mod models;
pub mod portfolio;
pub mod storage;
