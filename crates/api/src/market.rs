//! Market snapshot types and the fetcher abstraction.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;

/// Risk parameters and market state for a single reserve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    /// Ticker symbol (e.g., "ETH")
    pub symbol: String,
    /// Human readable name
    pub name: String,
    /// Token decimals
    pub decimals: u8,
    /// Loan-to-value as a fraction (0.75 = 75%)
    pub ltv: f64,
    /// Liquidation threshold as a fraction
    pub liquidation_threshold: f64,
    /// Liquidation bonus as a fraction (0.05 = 5% discount to liquidators)
    pub liquidation_bonus: f64,
    /// Supply APY as a fraction
    #[serde(rename = "supplyAPY")]
    pub supply_apy: f64,
    /// Variable borrow APY as a fraction
    #[serde(rename = "borrowAPY")]
    pub borrow_apy: f64,
    /// USD price
    pub price: f64,
    /// Total supplied (whole tokens)
    pub total_supply: f64,
    /// Total borrowed (whole tokens)
    pub total_borrow: f64,
    /// Borrowed / supplied
    pub utilization_rate: f64,
}

impl Asset {
    /// Check `0 <= ltv <= liquidation_threshold <= 1` and `price >= 0`.
    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);

        if !in_unit(self.ltv) || !in_unit(self.liquidation_threshold) {
            anyhow::bail!(
                "{}: ltv {} / liquidation threshold {} outside [0, 1]",
                self.symbol,
                self.ltv,
                self.liquidation_threshold
            );
        }
        if self.ltv > self.liquidation_threshold {
            anyhow::bail!(
                "{}: ltv {} exceeds liquidation threshold {}",
                self.symbol,
                self.ltv,
                self.liquidation_threshold
            );
        }
        if !self.price.is_finite() || self.price < 0.0 {
            anyhow::bail!("{}: invalid price {}", self.symbol, self.price);
        }
        Ok(())
    }
}

/// Complete market state for one chain, produced by a single fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    /// Assets keyed by symbol
    pub assets: HashMap<String, Asset>,
    /// When the data was produced
    pub last_updated: DateTime<Utc>,
    /// Chain the data belongs to
    pub chain_id: u64,
}

impl MarketSnapshot {
    /// Build a snapshot from a list of assets.
    pub fn new(
        chain_id: u64,
        last_updated: DateTime<Utc>,
        assets: impl IntoIterator<Item = Asset>,
    ) -> Self {
        Self {
            assets: assets.into_iter().map(|a| (a.symbol.clone(), a)).collect(),
            last_updated,
            chain_id,
        }
    }

    /// Look up an asset by symbol.
    pub fn asset(&self, symbol: &str) -> Option<&Asset> {
        self.assets.get(symbol)
    }

    /// Price of an asset, if listed.
    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.assets.get(symbol).map(|a| a.price)
    }

    /// Validate every asset in the snapshot.
    pub fn validate(&self) -> Result<()> {
        if self.assets.is_empty() {
            anyhow::bail!("snapshot for chain {} contains no assets", self.chain_id);
        }
        for asset in self.assets.values() {
            asset.validate()?;
        }
        Ok(())
    }

    /// Sorted list of listed symbols.
    pub fn symbols(&self) -> Vec<&str> {
        let mut symbols: Vec<&str> = self.assets.keys().map(String::as_str).collect();
        symbols.sort_unstable();
        symbols
    }
}

/// Source of market snapshots.
///
/// Production implementations query an external indexing service; tests
/// supply a stub.
#[async_trait]
pub trait MarketDataFetcher: Send + Sync + Debug {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Fetch a complete snapshot for the given chain.
    async fn fetch(&self, chain_id: u64) -> Result<MarketSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_asset_validation() {
        assert!(eth().validate().is_ok());

        let mut inverted = eth();
        inverted.ltv = 0.9;
        assert!(inverted.validate().is_err());

        let mut negative = eth();
        negative.price = -1.0;
        assert!(negative.validate().is_err());

        let mut over_one = eth();
        over_one.liquidation_threshold = 1.2;
        assert!(over_one.validate().is_err());
    }

    #[test]
    fn test_snapshot_lookup() {
        let snapshot = MarketSnapshot::new(1, Utc::now(), vec![eth()]);
        assert_eq!(snapshot.price("ETH"), Some(2000.0));
        assert!(snapshot.asset("DOGE").is_none());
        assert_eq!(snapshot.symbols(), vec!["ETH"]);
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(eth()).unwrap();
        assert_eq!(json["liquidationThreshold"], 0.82);
        assert_eq!(json["supplyAPY"], 0.02);
        assert_eq!(json["borrowAPY"], 0.04);
    }
}
