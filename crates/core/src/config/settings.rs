//! Runtime configuration with profile support.
//!
//! Provides centralized configuration for the simulator, risk thresholds and
//! the market-data cache, with support for different profiles (default,
//! conservative, aggressive).

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::network::ChainConfig;
use crate::simulator::LoopStrategy;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LooperConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    /// Market data cache behaviour
    #[serde(default)]
    pub market: MarketConfig,

    /// Leverage loop tunables
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Health factor thresholds
    #[serde(default)]
    pub risk: RiskConfig,

    /// Chain and subgraph endpoint
    #[serde(default)]
    pub chain: ChainConfig,

    /// Feature flags
    #[serde(default)]
    pub features: FeatureFlags,

    /// Strategy used when the caller supplies none
    #[serde(default)]
    pub strategy: LoopStrategy,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Market data cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Snapshot time-to-live (seconds)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Upper bound on a single fetch (milliseconds)
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,

    /// Serve the last cached snapshot when a refetch fails
    #[serde(default = "default_serve_stale")]
    pub serve_stale_on_failure: bool,
}

fn default_cache_ttl() -> u64 {
    30
}
fn default_fetch_timeout() -> u64 {
    10_000
}
fn default_serve_stale() -> bool {
    true
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            fetch_timeout_ms: default_fetch_timeout(),
            serve_stale_on_failure: default_serve_stale(),
        }
    }
}

impl MarketConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Leverage loop tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Fraction of the borrowable amount actually borrowed each loop.
    ///
    /// Keeping some headroom below the full collateral ratio stops the
    /// position from sitting exactly at its borrow limit. Must be in (0, 1].
    #[serde(default = "default_borrow_headroom")]
    pub borrow_headroom: f64,
}

/// Historical headroom; changing it changes every simulated trajectory.
pub const DEFAULT_BORROW_HEADROOM: f64 = 0.8;

fn default_borrow_headroom() -> f64 {
    DEFAULT_BORROW_HEADROOM
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            borrow_headroom: default_borrow_headroom(),
        }
    }
}

/// Health factor thresholds used for risk classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Below this (and >= 1.0) a position is Critical
    #[serde(default = "default_min_hf")]
    pub min_health_factor: f64,

    /// At or above this a position is Safe
    #[serde(default = "default_hf_target")]
    pub health_factor_target: f64,

    /// Upper bound accepted for strategy targets; the simulator rejects
    /// strategies asking for more
    #[serde(default = "default_max_hf")]
    pub max_health_factor: f64,

    /// Required margin above HF 1.0 (fraction). Assessments below
    /// `1 + liquidation_buffer` are flagged as buffer breaches.
    #[serde(default = "default_liquidation_buffer")]
    pub liquidation_buffer: f64,

    /// Maximum leverage (collateral value / equity). Assessments above it
    /// are flagged.
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
}

fn default_min_hf() -> f64 {
    1.2
}
fn default_hf_target() -> f64 {
    1.8
}
fn default_max_hf() -> f64 {
    3.0
}
fn default_liquidation_buffer() -> f64 {
    0.1
}
fn default_max_leverage() -> f64 {
    10.0
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            min_health_factor: default_min_hf(),
            health_factor_target: default_hf_target(),
            max_health_factor: default_max_hf(),
            liquidation_buffer: default_liquidation_buffer(),
            max_leverage: default_max_leverage(),
        }
    }
}

/// Feature flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Allow flash-loan rescue previews
    #[serde(default)]
    pub flash_loans: bool,

    /// Allow running simulations
    #[serde(default = "default_simulation_enabled")]
    pub simulation: bool,
}

fn default_simulation_enabled() -> bool {
    true
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            flash_loans: false,
            simulation: default_simulation_enabled(),
        }
    }
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            market: MarketConfig::default(),
            simulation: SimulationConfig::default(),
            risk: RiskConfig::default(),
            chain: ChainConfig::default(),
            features: FeatureFlags::default(),
            strategy: LoopStrategy::default(),
        }
    }
}

impl LooperConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.chain.expand_env_vars();
        Ok(config)
    }

    /// Lower-leverage profile: less headroom, stricter thresholds.
    pub fn conservative() -> Self {
        Self {
            profile: "conservative".to_string(),
            simulation: SimulationConfig {
                borrow_headroom: 0.6,
            },
            risk: RiskConfig {
                min_health_factor: 1.5,
                health_factor_target: 2.0,
                max_leverage: 4.0,
                ..Default::default()
            },
            strategy: LoopStrategy {
                collateral_ratio: 0.6,
                health_factor_target: 2.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Higher-leverage profile.
    pub fn aggressive() -> Self {
        Self {
            profile: "aggressive".to_string(),
            market: MarketConfig {
                cache_ttl_secs: 10,
                ..Default::default()
            },
            simulation: SimulationConfig {
                borrow_headroom: 0.9,
            },
            risk: RiskConfig {
                min_health_factor: 1.1,
                health_factor_target: 1.4,
                ..Default::default()
            },
            strategy: LoopStrategy {
                collateral_ratio: 0.8,
                max_loops: 5,
                health_factor_target: 1.4,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Resolve the profile named by `LOOPER_PROFILE` (a profile name or a
    /// TOML path), then apply environment overrides.
    pub fn from_env() -> anyhow::Result<Self> {
        let profile = std::env::var("LOOPER_PROFILE").unwrap_or_else(|_| "default".to_string());

        let mut config = match profile.to_lowercase().as_str() {
            "conservative" | "safe" => Self::conservative(),
            "aggressive" | "aggro" => Self::aggressive(),
            "default" | "" => Self::default(),
            path if path.ends_with(".toml") => Self::from_file(&profile)?,
            other => anyhow::bail!("unknown LOOPER_PROFILE '{}'", other),
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `CHAIN_ID`, `GRAPH_API_URL`, `GRAPH_API_KEY`,
    /// `ENABLE_FLASH_LOANS` and `ENABLE_SIMULATION`.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(chain_id) = std::env::var("CHAIN_ID") {
            self.chain.chain_id = chain_id
                .parse()
                .with_context(|| format!("invalid CHAIN_ID '{}'", chain_id))?;
        }
        if let Ok(url) = std::env::var("GRAPH_API_URL") {
            self.chain.graph_api_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Ok(key) = std::env::var("GRAPH_API_KEY") {
            self.chain.graph_api_key = key;
        }
        if let Ok(flag) = std::env::var("ENABLE_FLASH_LOANS") {
            self.features.flash_loans = flag == "true";
        }
        if let Ok(flag) = std::env::var("ENABLE_SIMULATION") {
            self.features.simulation = flag != "false";
        }
        Ok(())
    }

    /// Collect configuration problems. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.chain.chain_id == 0 {
            errors.push("valid chain id is required".to_string());
        }
        if matches!(&self.chain.graph_api_url, Some(url) if url.trim().is_empty()) {
            errors.push("graph API URL is empty".to_string());
        }
        if self.market.cache_ttl_secs == 0 {
            errors.push("market cache TTL must be positive".to_string());
        }
        if self.market.fetch_timeout_ms == 0 {
            errors.push("market fetch timeout must be positive".to_string());
        }
        let headroom = self.simulation.borrow_headroom;
        if !(headroom > 0.0 && headroom <= 1.0) {
            errors.push(format!("borrow headroom {} outside (0, 1]", headroom));
        }
        let risk = &self.risk;
        if risk.min_health_factor < 1.0 {
            errors.push(format!("min health factor {} below 1.0", risk.min_health_factor));
        }
        if !(risk.min_health_factor <= risk.health_factor_target
            && risk.health_factor_target <= risk.max_health_factor)
        {
            errors.push(format!(
                "health factor thresholds out of order: min {} / target {} / max {}",
                risk.min_health_factor, risk.health_factor_target, risk.max_health_factor
            ));
        }
        if !(risk.liquidation_buffer.is_finite() && risk.liquidation_buffer >= 0.0) {
            errors.push(format!("liquidation buffer {} is negative", risk.liquidation_buffer));
        }
        if !(risk.max_leverage >= 1.0) {
            errors.push(format!("max leverage {} below 1.0", risk.max_leverage));
        }
        if self.strategy.health_factor_target > risk.max_health_factor {
            errors.push(format!(
                "strategy health factor target {} above max {}",
                self.strategy.health_factor_target, risk.max_health_factor
            ));
        }

        errors
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Configuration loaded");
        tracing::info!(
            chain_id = self.chain.chain_id,
            network = self.chain.network().map(|n| n.name).unwrap_or("unknown"),
            subgraph = self.chain.graph_api_url.as_deref().unwrap_or("<static>"),
            "Chain"
        );
        tracing::info!(
            cache_ttl_secs = self.market.cache_ttl_secs,
            fetch_timeout_ms = self.market.fetch_timeout_ms,
            serve_stale = self.market.serve_stale_on_failure,
            "Market data cache"
        );
        tracing::info!(
            borrow_headroom = self.simulation.borrow_headroom,
            min_hf = self.risk.min_health_factor,
            hf_target = self.risk.health_factor_target,
            max_hf = self.risk.max_health_factor,
            liquidation_buffer = self.risk.liquidation_buffer,
            max_leverage = self.risk.max_leverage,
            "Risk parameters"
        );
        tracing::info!(
            flash_loans = self.features.flash_loans,
            simulation = self.features.simulation,
            "Feature flags"
        );
    }
}
