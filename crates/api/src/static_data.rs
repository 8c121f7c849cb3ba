//! Hardcoded market tables for offline previews and fetch failures.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::market::{Asset, MarketDataFetcher, MarketSnapshot};

fn eth() -> Asset {
    Asset {
        symbol: "ETH".to_string(),
        name: "Ethereum".to_string(),
        decimals: 18,
        ltv: 0.75,
        liquidation_threshold: 0.82,
        liquidation_bonus: 0.05,
        supply_apy: 0.02,
        borrow_apy: 0.04,
        price: 2000.0,
        total_supply: 1_000_000.0,
        total_borrow: 500_000.0,
        utilization_rate: 0.5,
    }
}

fn usdc() -> Asset {
    Asset {
        symbol: "USDC".to_string(),
        name: "USD Coin".to_string(),
        decimals: 6,
        ltv: 0.85,
        liquidation_threshold: 0.89,
        liquidation_bonus: 0.05,
        supply_apy: 0.03,
        borrow_apy: 0.05,
        price: 1.0,
        total_supply: 50_000_000.0,
        total_borrow: 30_000_000.0,
        utilization_rate: 0.6,
    }
}

fn wbtc() -> Asset {
    Asset {
        symbol: "WBTC".to_string(),
        name: "Wrapped Bitcoin".to_string(),
        decimals: 8,
        ltv: 0.70,
        liquidation_threshold: 0.75,
        liquidation_bonus: 0.05,
        supply_apy: 0.01,
        borrow_apy: 0.03,
        price: 40_000.0,
        total_supply: 10_000.0,
        total_borrow: 5_000.0,
        utilization_rate: 0.5,
    }
}

/// Fallback snapshot served when a fetch fails.
///
/// Values:
///
/// | Asset | LTV  | LT   | Bonus | Supply | Borrow | Price |
/// |-------|------|------|-------|--------|--------|-------|
/// | ETH   | 0.75 | 0.82 | 0.05  | 2%     | 4%     | 2000  |
/// | USDC  | 0.85 | 0.89 | 0.05  | 3%     | 5%     | 1     |
pub fn fallback_snapshot(chain_id: u64, timestamp: DateTime<Utc>) -> MarketSnapshot {
    MarketSnapshot::new(chain_id, timestamp, vec![eth(), usdc()])
}

/// Fetcher returning a fixed table (ETH, USDC, WBTC).
///
/// Used when no subgraph endpoint is configured.
#[derive(Debug, Clone, Default)]
pub struct StaticMarketFetcher;

impl StaticMarketFetcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MarketDataFetcher for StaticMarketFetcher {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn fetch(&self, chain_id: u64) -> Result<MarketSnapshot> {
        Ok(MarketSnapshot::new(chain_id, Utc::now(), vec![eth(), usdc(), wbtc()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_covers_loop_pair() {
        let snapshot = fallback_snapshot(137, Utc::now());
        assert_eq!(snapshot.chain_id, 137);
        assert!(snapshot.validate().is_ok());
        assert_eq!(snapshot.symbols(), vec!["ETH", "USDC"]);
        assert_eq!(snapshot.asset("ETH").unwrap().liquidation_threshold, 0.82);
    }

    #[tokio::test]
    async fn test_static_fetcher() {
        let snapshot = StaticMarketFetcher::new().fetch(1).await.unwrap();
        assert!(snapshot.validate().is_ok());
        assert_eq!(snapshot.price("WBTC"), Some(40_000.0));
    }
}
