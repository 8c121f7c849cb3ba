//! Health factor and liquidation price calculations.
//!
//! All functions are pure. Amounts are token units keyed by asset symbol and
//! valued at the snapshot price. Symbols the snapshot does not list contribute
//! nothing.

use looper_api::{Asset, MarketSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::RiskConfig;

/// Health factor target used when none is given.
pub const DEFAULT_HEALTH_FACTOR_TARGET: f64 = 1.8;

/// Live multi-asset position: symbol → token amount.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub collateral: BTreeMap<String, f64>,
    pub debt: BTreeMap<String, f64>,
}

impl Position {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collateral(mut self, symbol: impl Into<String>, amount: f64) -> Self {
        self.collateral.insert(symbol.into(), amount);
        self
    }

    pub fn with_debt(mut self, symbol: impl Into<String>, amount: f64) -> Self {
        self.debt.insert(symbol.into(), amount);
        self
    }
}

/// Risk tier derived from the health factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskTier {
    /// HF < 1.0
    Liquidatable,
    /// 1.0 <= HF < min health factor
    Critical,
    /// min health factor <= HF < target
    Warning,
    /// HF >= target
    Safe,
}

impl RiskTier {
    /// Classify a health factor against the configured thresholds.
    pub fn from_health_factor(hf: f64, cfg: &RiskConfig) -> Self {
        if hf < 1.0 {
            Self::Liquidatable
        } else if hf < cfg.min_health_factor {
            Self::Critical
        } else if hf < cfg.health_factor_target {
            Self::Warning
        } else {
            Self::Safe
        }
    }
}

/// Result of assessing a live position.
///
/// Serialize-only: an infinite health factor renders as `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub total_collateral_value: f64,
    pub total_debt_value: f64,
    pub health_factor: f64,
    /// Collateral symbol → price at which the position becomes liquidatable
    pub liquidation_prices: BTreeMap<String, f64>,
    /// Σ amount · price · LTV
    pub borrow_capacity: f64,
    /// Debt value / borrow capacity
    pub utilization: f64,
    pub liquidation_buffer_pct: f64,
    /// HF below `1 + RiskConfig::liquidation_buffer`
    pub buffer_breached: bool,
    /// Collateral value / (collateral value - debt value)
    pub leverage: f64,
    /// Leverage above `RiskConfig::max_leverage`
    pub leverage_exceeded: bool,
    pub tier: RiskTier,
}

fn value_of(
    amounts: &BTreeMap<String, f64>,
    market: &MarketSnapshot,
    weight: impl Fn(&Asset) -> f64,
) -> f64 {
    amounts
        .iter()
        .filter_map(|(symbol, amount)| {
            market
                .asset(symbol)
                .map(|asset| amount * asset.price * weight(asset))
        })
        .sum()
}

/// Σ amount · price over the listed symbols.
pub fn total_value(amounts: &BTreeMap<String, f64>, market: &MarketSnapshot) -> f64 {
    value_of(amounts, market, |_| 1.0)
}

/// Σ(c · price · LT) / Σ(d · price). `f64::INFINITY` when there is no debt.
pub fn health_factor(
    collateral: &BTreeMap<String, f64>,
    debt: &BTreeMap<String, f64>,
    market: &MarketSnapshot,
) -> f64 {
    let debt_value = total_value(debt, market);
    if debt_value <= 0.0 {
        return f64::INFINITY;
    }
    value_of(collateral, market, |a| a.liquidation_threshold) / debt_value
}

/// Per collateral asset: total debt value / (amount · LT).
///
/// Assets with a zero amount, a non-positive threshold or no snapshot entry
/// are omitted.
pub fn liquidation_price(
    collateral: &BTreeMap<String, f64>,
    debt: &BTreeMap<String, f64>,
    market: &MarketSnapshot,
) -> BTreeMap<String, f64> {
    let debt_value = total_value(debt, market);

    collateral
        .iter()
        .filter(|(_, amount)| **amount > 0.0)
        .filter_map(|(symbol, amount)| {
            let lt = market.asset(symbol)?.liquidation_threshold;
            (lt > 0.0).then(|| (symbol.clone(), debt_value / (amount * lt)))
        })
        .collect()
}

/// Single-pair health factor used inside the leverage loop.
#[inline]
pub fn simple_health_factor(collateral: f64, debt: f64, collateral_ratio: f64) -> f64 {
    if debt == 0.0 {
        return f64::INFINITY;
    }
    collateral * collateral_ratio / debt
}

#[inline]
pub fn is_position_safe(hf: f64, target: f64) -> bool {
    hf >= target
}

/// Distance above liquidation, in percent.
#[inline]
pub fn liquidation_buffer_pct(hf: f64) -> f64 {
    (hf - 1.0) * 100.0
}

/// Σ amount · price · LTV.
pub fn borrow_capacity(collateral: &BTreeMap<String, f64>, market: &MarketSnapshot) -> f64 {
    value_of(collateral, market, |a| a.ltv)
}

/// Collateral value per unit of equity. 1.0 without debt, `f64::INFINITY`
/// once debt reaches the collateral value.
pub fn leverage(collateral_value: f64, debt_value: f64) -> f64 {
    if debt_value <= 0.0 {
        return 1.0;
    }
    let equity = collateral_value - debt_value;
    if equity <= 0.0 {
        return f64::INFINITY;
    }
    collateral_value / equity
}

/// Risk assessment with tier thresholds taken from [`RiskConfig`].
#[derive(Debug, Clone, Default)]
pub struct RiskCalculator {
    config: RiskConfig,
}

impl RiskCalculator {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn assess(&self, position: &Position, market: &MarketSnapshot) -> RiskAssessment {
        let total_collateral_value = total_value(&position.collateral, market);
        let total_debt_value = total_value(&position.debt, market);
        let hf = health_factor(&position.collateral, &position.debt, market);
        let capacity = borrow_capacity(&position.collateral, market);

        let utilization = if total_debt_value <= 0.0 {
            0.0
        } else if capacity <= 0.0 {
            f64::INFINITY
        } else {
            total_debt_value / capacity
        };
        let leverage = leverage(total_collateral_value, total_debt_value);

        RiskAssessment {
            total_collateral_value,
            total_debt_value,
            health_factor: hf,
            liquidation_prices: liquidation_price(&position.collateral, &position.debt, market),
            borrow_capacity: capacity,
            utilization,
            liquidation_buffer_pct: liquidation_buffer_pct(hf),
            buffer_breached: hf < 1.0 + self.config.liquidation_buffer,
            leverage,
            leverage_exceeded: leverage > self.config.max_leverage,
            tier: RiskTier::from_health_factor(hf, &self.config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use looper_api::fallback_snapshot;

    fn market() -> MarketSnapshot {
        fallback_snapshot(1, Utc::now())
    }

    fn with_eth_threshold(lt: f64) -> MarketSnapshot {
        let base = market();
        let assets = base.assets.values().cloned().map(|mut a: Asset| {
            if a.symbol == "ETH" {
                a.liquidation_threshold = lt;
                a.ltv = a.ltv.min(lt);
            }
            a
        });
        MarketSnapshot::new(1, base.last_updated, assets)
    }

    fn map(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
        entries.iter().map(|(s, a)| (s.to_string(), *a)).collect()
    }

    #[test]
    fn test_health_factor_multi_asset() {
        // 1 ETH @ 2000, LT 0.82; 1000 USDC debt @ 1
        let hf = health_factor(&map(&[("ETH", 1.0)]), &map(&[("USDC", 1000.0)]), &market());
        assert!((hf - 1.64).abs() < 1e-9);
    }

    #[test]
    fn test_health_factor_infinite_without_debt() {
        let market = market();
        let collateral = map(&[("ETH", 5.0)]);
        assert_eq!(health_factor(&collateral, &BTreeMap::new(), &market), f64::INFINITY);
        assert_eq!(health_factor(&collateral, &map(&[("USDC", 0.0)]), &market), f64::INFINITY);
        assert_eq!(simple_health_factor(100.0, 0.0, 0.75), f64::INFINITY);
    }

    #[test]
    fn test_unknown_symbols_ignored() {
        let hf = health_factor(
            &map(&[("ETH", 1.0), ("DOGE", 1000.0)]),
            &map(&[("USDC", 1000.0)]),
            &market(),
        );
        assert!((hf - 1.64).abs() < 1e-9);
    }

    #[test]
    fn test_liquidation_price() {
        let prices = liquidation_price(
            &map(&[("ETH", 1.0), ("USDC", 0.0)]),
            &map(&[("USDC", 1000.0)]),
            &market(),
        );
        assert_eq!(prices.len(), 1);
        assert!((prices["ETH"] - 1000.0 / 0.82).abs() < 1e-9);
    }

    #[test]
    fn test_liquidation_price_decreases_with_threshold() {
        let collateral = map(&[("ETH", 2.0)]);
        let debt = map(&[("USDC", 1500.0)]);

        let mut previous = f64::INFINITY;
        for lt in [0.5, 0.6, 0.7, 0.8, 0.9] {
            let price = liquidation_price(&collateral, &debt, &with_eth_threshold(lt))["ETH"];
            assert!(price < previous, "lt {lt}: {price} !< {previous}");
            previous = price;
        }
    }

    #[test]
    fn test_simple_health_factor() {
        assert!((simple_health_factor(160.0, 60.0, 0.75) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_safety_helpers() {
        assert!(is_position_safe(1.8, DEFAULT_HEALTH_FACTOR_TARGET));
        assert!(!is_position_safe(1.79, DEFAULT_HEALTH_FACTOR_TARGET));
        assert!((liquidation_buffer_pct(1.25) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_tiers() {
        let cfg = RiskConfig::default();
        assert_eq!(RiskTier::from_health_factor(0.99, &cfg), RiskTier::Liquidatable);
        assert_eq!(RiskTier::from_health_factor(1.0, &cfg), RiskTier::Critical);
        assert_eq!(RiskTier::from_health_factor(1.5, &cfg), RiskTier::Warning);
        assert_eq!(RiskTier::from_health_factor(1.8, &cfg), RiskTier::Safe);
        assert_eq!(RiskTier::from_health_factor(f64::INFINITY, &cfg), RiskTier::Safe);
    }

    #[test]
    fn test_assess() {
        let position = Position::new()
            .with_collateral("ETH", 1.0)
            .with_debt("USDC", 1000.0);
        let assessment = RiskCalculator::default().assess(&position, &market());

        assert_eq!(assessment.total_collateral_value, 2000.0);
        assert_eq!(assessment.total_debt_value, 1000.0);
        assert!((assessment.borrow_capacity - 1500.0).abs() < 1e-9);
        assert!((assessment.utilization - 1000.0 / 1500.0).abs() < 1e-9);
        assert!((assessment.liquidation_buffer_pct - 64.0).abs() < 1e-9);
        assert!(!assessment.buffer_breached);
        assert!((assessment.leverage - 2.0).abs() < 1e-9);
        assert!(!assessment.leverage_exceeded);
        assert_eq!(assessment.tier, RiskTier::Warning);
    }

    #[test]
    fn test_leverage() {
        assert_eq!(leverage(2000.0, 0.0), 1.0);
        assert!((leverage(2000.0, 1500.0) - 4.0).abs() < 1e-9);
        assert_eq!(leverage(1000.0, 1000.0), f64::INFINITY);
        assert_eq!(leverage(1000.0, 1200.0), f64::INFINITY);
    }

    #[test]
    fn test_assess_flags_risk_limits() {
        // HF 1.025, leverage 5
        let position = Position::new()
            .with_collateral("ETH", 1.0)
            .with_debt("USDC", 1600.0);
        let config = RiskConfig {
            liquidation_buffer: 0.05,
            max_leverage: 5.0,
            ..Default::default()
        };
        let assessment = RiskCalculator::new(config).assess(&position, &market());
        assert!(assessment.buffer_breached);
        assert!((assessment.leverage - 5.0).abs() < 1e-9);
        assert!(!assessment.leverage_exceeded);

        let position = position.with_debt("USDC", 1700.0);
        let assessment = RiskCalculator::new(RiskConfig {
            max_leverage: 5.0,
            ..Default::default()
        })
        .assess(&position, &market());
        assert!(assessment.leverage_exceeded);
        assert!(assessment.buffer_breached);
    }
}
