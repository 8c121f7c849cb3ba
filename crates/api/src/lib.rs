//! Market data clients for the leverage loop simulator.
//!
//! This crate provides:
//! - Market snapshot types (per-asset risk parameters and prices)
//! - The pluggable [`MarketDataFetcher`] trait
//! - Aave subgraph client for live reserve data
//! - Static fetcher and hardcoded fallback snapshot for offline use

mod graph;
mod market;
mod static_data;

pub use graph::AaveGraphClient;
pub use market::{Asset, MarketDataFetcher, MarketSnapshot};
pub use static_data::{fallback_snapshot, StaticMarketFetcher};
