//! Aave subgraph client for live reserve data.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::market::{Asset, MarketDataFetcher, MarketSnapshot};

/// Reserve parameters are reported in basis points.
const BPS: f64 = 10_000.0;

/// Rates are reported in ray units (27 decimals).
const RAY: f64 = 1e27;

/// Oracle prices use 8 decimals in the v3 subgraph.
const PRICE_DECIMALS: i32 = 8;

const SECONDS_PER_YEAR: f64 = 31_536_000.0;

const RESERVES_QUERY: &str = r#"{
  reserves(where: { isActive: true }) {
    symbol
    name
    decimals
    baseLTVasCollateral
    reserveLiquidationThreshold
    reserveLiquidationBonus
    liquidityRate
    variableBorrowRate
    totalLiquidity
    totalCurrentVariableDebt
    utilizationRate
    price { priceInEth }
  }
}"#;

/// Aave v3 subgraph client.
#[derive(Debug, Clone)]
pub struct AaveGraphClient {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
}

impl AaveGraphClient {
    /// Create a client against the given subgraph endpoint.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: None,
        }
    }

    /// Set the gateway API key (sent as a bearer token).
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let key = api_key.into();
        self.api_key = if key.is_empty() { None } else { Some(key) };
        self
    }

    /// Set the HTTP request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        self
    }

    /// Endpoint this client queries.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Fetch all active reserves.
    #[instrument(skip(self))]
    pub async fn fetch_reserves(&self) -> Result<Vec<ReserveData>> {
        let body = GraphRequest {
            query: RESERVES_QUERY,
        };
        let mut request = self.client.post(&self.api_url).json(&body);

        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("subgraph request to {} failed", self.api_url))?
            .error_for_status()?;

        let body: GraphResponse = response.json().await.context("invalid subgraph response")?;

        if let Some(errors) = body.errors.filter(|e| !e.is_empty()) {
            let messages: Vec<_> = errors.into_iter().map(|e| e.message).collect();
            anyhow::bail!("subgraph returned errors: {}", messages.join("; "));
        }

        let reserves = body
            .data
            .map(|d| d.reserves)
            .ok_or_else(|| anyhow::anyhow!("subgraph response has no data"))?;

        debug!(count = reserves.len(), "Fetched reserves");
        Ok(reserves)
    }
}

#[async_trait]
impl MarketDataFetcher for AaveGraphClient {
    fn name(&self) -> &'static str {
        "aave-subgraph"
    }

    async fn fetch(&self, chain_id: u64) -> Result<MarketSnapshot> {
        let reserves = self.fetch_reserves().await?;

        let mut assets = Vec::with_capacity(reserves.len());
        for reserve in reserves {
            match reserve.to_asset() {
                Ok(asset) => assets.push(asset),
                Err(e) => warn!(symbol = %reserve.symbol, error = %e, "Skipping malformed reserve"),
            }
        }

        let snapshot = MarketSnapshot::new(chain_id, Utc::now(), assets);
        snapshot.validate()?;

        info!(
            chain_id,
            assets = snapshot.assets.len(),
            "Fetched market snapshot from subgraph"
        );

        Ok(snapshot)
    }
}

#[derive(Debug, Serialize)]
struct GraphRequest {
    query: &'static str,
}

#[derive(Debug, Deserialize)]
struct GraphResponse {
    data: Option<ReservesData>,
    errors: Option<Vec<GraphError>>,
}

#[derive(Debug, Deserialize)]
struct ReservesData {
    reserves: Vec<ReserveData>,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    message: String,
}

/// Raw reserve entry as returned by the subgraph.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveData {
    pub symbol: String,
    pub name: String,
    #[serde(deserialize_with = "deserialize_u8_from_string")]
    pub decimals: u8,
    /// LTV in basis points
    #[serde(rename = "baseLTVasCollateral", deserialize_with = "deserialize_f64_from_string")]
    pub base_ltv_as_collateral: f64,
    /// Liquidation threshold in basis points
    #[serde(deserialize_with = "deserialize_f64_from_string")]
    pub reserve_liquidation_threshold: f64,
    /// Liquidation bonus in basis points, offset by 10000 (10500 = 5%)
    #[serde(deserialize_with = "deserialize_f64_from_string")]
    pub reserve_liquidation_bonus: f64,
    /// Supply APR in ray
    #[serde(deserialize_with = "deserialize_f64_from_string")]
    pub liquidity_rate: f64,
    /// Variable borrow APR in ray
    #[serde(deserialize_with = "deserialize_f64_from_string")]
    pub variable_borrow_rate: f64,
    /// Raw token units
    #[serde(deserialize_with = "deserialize_f64_from_string")]
    pub total_liquidity: f64,
    /// Raw token units
    #[serde(deserialize_with = "deserialize_f64_from_string")]
    pub total_current_variable_debt: f64,
    #[serde(default, deserialize_with = "deserialize_optional_f64")]
    pub utilization_rate: Option<f64>,
    pub price: ReservePrice,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservePrice {
    #[serde(deserialize_with = "deserialize_f64_from_string")]
    pub price_in_eth: f64,
}

impl ReserveData {
    /// Convert raw subgraph units into an [`Asset`].
    pub fn to_asset(&self) -> Result<Asset> {
        let scale = 10_f64.powi(self.decimals as i32);
        let total_supply = self.total_liquidity / scale;
        let total_borrow = self.total_current_variable_debt / scale;

        let utilization_rate = self.utilization_rate.unwrap_or(if total_supply > 0.0 {
            total_borrow / total_supply
        } else {
            0.0
        });

        let asset = Asset {
            symbol: self.symbol.clone(),
            name: self.name.clone(),
            decimals: self.decimals,
            ltv: self.base_ltv_as_collateral / BPS,
            liquidation_threshold: self.reserve_liquidation_threshold / BPS,
            liquidation_bonus: (self.reserve_liquidation_bonus / BPS - 1.0).max(0.0),
            supply_apy: ray_rate_to_apy(self.liquidity_rate),
            borrow_apy: ray_rate_to_apy(self.variable_borrow_rate),
            price: self.price.price_in_eth / 10_f64.powi(PRICE_DECIMALS),
            total_supply,
            total_borrow,
            utilization_rate,
        };

        asset.validate()?;
        Ok(asset)
    }
}

/// Convert a per-year ray rate into an APY with per-second compounding.
pub fn ray_rate_to_apy(rate_ray: f64) -> f64 {
    let apr = rate_ray / RAY;
    (1.0 + apr / SECONDS_PER_YEAR).powf(SECONDS_PER_YEAR) - 1.0
}

fn deserialize_f64_from_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(f64),
    }

    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s.parse().map_err(serde::de::Error::custom),
        StringOrNumber::Number(n) => Ok(n),
    }
}

fn deserialize_u8_from_string<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(u8),
    }

    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s.parse().map_err(serde::de::Error::custom),
        StringOrNumber::Number(n) => Ok(n),
    }
}

fn deserialize_optional_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(f64),
    }

    match Option::<StringOrNumber>::deserialize(deserializer)? {
        Some(StringOrNumber::String(s)) if s.is_empty() => Ok(None),
        Some(StringOrNumber::String(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
        Some(StringOrNumber::Number(n)) => Ok(Some(n)),
        None => Ok(None),
    }
}
