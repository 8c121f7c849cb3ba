//! Recursive leverage loop simulation.
//!
//! Each loop borrows a fixed fraction (the borrow headroom) of what the
//! collateral ratio still allows, and re-supplies the borrowed amount as
//! collateral. The loop always runs `max_loops` times.

use looper_api::MarketSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::{SimulationConfig, DEFAULT_BORROW_HEADROOM};
use crate::error::LoopError;
use crate::risk::{self, simple_health_factor};

/// Upper bound on `max_loops`.
pub const MAX_LOOPS: u32 = 10;

/// Asset pair a strategy loops over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyAssets {
    pub collateral: String,
    pub borrow: String,
}

impl Default for StrategyAssets {
    fn default() -> Self {
        Self {
            collateral: "ETH".to_string(),
            borrow: "USDC".to_string(),
        }
    }
}

/// Caller-supplied loop parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoopStrategy {
    /// Starting collateral (> 0)
    pub initial_deposit: f64,
    /// Borrowable fraction of collateral, in (0, 1]
    pub collateral_ratio: f64,
    /// Number of loops, in [1, MAX_LOOPS]
    pub max_loops: u32,
    /// Desired health factor (>= 1). Reported against, not enforced.
    pub health_factor_target: f64,
    /// Echoed back as `flashLoanUsed`
    pub flash_loan_rescue: bool,
    pub assets: StrategyAssets,
}

impl Default for LoopStrategy {
    fn default() -> Self {
        Self {
            initial_deposit: 100.0,
            collateral_ratio: 0.75,
            max_loops: 3,
            health_factor_target: risk::DEFAULT_HEALTH_FACTOR_TARGET,
            flash_loan_rescue: true,
            assets: StrategyAssets::default(),
        }
    }
}

impl LoopStrategy {
    /// Check every parameter before anything runs.
    pub fn validate(&self) -> Result<(), LoopError> {
        if !(self.initial_deposit.is_finite() && self.initial_deposit > 0.0) {
            return Err(LoopError::invalid_strategy(format!(
                "initial deposit must be positive, got {}",
                self.initial_deposit
            )));
        }
        if !(self.collateral_ratio.is_finite()
            && self.collateral_ratio > 0.0
            && self.collateral_ratio <= 1.0)
        {
            return Err(LoopError::invalid_strategy(format!(
                "collateral ratio must be in (0, 1], got {}",
                self.collateral_ratio
            )));
        }
        if !(1..=MAX_LOOPS).contains(&self.max_loops) {
            return Err(LoopError::invalid_strategy(format!(
                "max loops must be in [1, {MAX_LOOPS}], got {}",
                self.max_loops
            )));
        }
        if !(self.health_factor_target.is_finite() && self.health_factor_target >= 1.0) {
            return Err(LoopError::invalid_strategy(format!(
                "health factor target must be at least 1, got {}",
                self.health_factor_target
            )));
        }
        Ok(())
    }
}

/// State after one loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopIteration {
    /// 1-based
    pub loop_index: u32,
    pub collateral: f64,
    pub debt: f64,
    pub health_factor: f64,
    pub borrowable: f64,
    pub borrowed: f64,
}

/// Loop outcome. Serialize-only: infinite health factors render as `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub collateral: f64,
    pub debt: f64,
    pub health_factor: f64,
    pub loops: Vec<LoopIteration>,
    pub flash_loan_used: bool,
    /// Final collateral / initial deposit
    pub leverage: f64,
    pub health_factor_target: f64,
    pub meets_target: bool,
    /// First loop whose health factor fell below the target
    pub target_breached_at: Option<u32>,
    /// Collateral price at which the final position is liquidatable
    pub liquidation_price: Option<f64>,
    /// Net APY on the initial deposit
    #[serde(rename = "totalAPY")]
    pub total_apy: Option<f64>,
}

/// Runs leverage loops. Holds no state beyond its tunables.
#[derive(Debug, Clone, Copy)]
pub struct PositionSimulator {
    borrow_headroom: f64,
    /// Highest strategy health factor target accepted
    max_health_factor_target: Option<f64>,
}

impl Default for PositionSimulator {
    fn default() -> Self {
        Self {
            borrow_headroom: DEFAULT_BORROW_HEADROOM,
            max_health_factor_target: None,
        }
    }
}

impl PositionSimulator {
    pub fn new(config: &SimulationConfig) -> Result<Self, LoopError> {
        let headroom = config.borrow_headroom;
        if !(headroom.is_finite() && headroom > 0.0 && headroom <= 1.0) {
            return Err(LoopError::Config(format!(
                "borrow headroom {headroom} outside (0, 1]"
            )));
        }
        Ok(Self {
            borrow_headroom: headroom,
            max_health_factor_target: None,
        })
    }

    /// Reject strategies whose health factor target is above `max`.
    pub fn with_max_health_factor_target(mut self, max: f64) -> Self {
        self.max_health_factor_target = Some(max);
        self
    }

    fn check_strategy(&self, strategy: &LoopStrategy) -> Result<(), LoopError> {
        strategy.validate()?;
        match self.max_health_factor_target {
            Some(max) if strategy.health_factor_target > max => {
                Err(LoopError::invalid_strategy(format!(
                    "health factor target {} above maximum {max}",
                    strategy.health_factor_target
                )))
            }
            _ => Ok(()),
        }
    }

    /// Run the loop with amounts in abstract collateral units.
    pub fn simulate(&self, strategy: &LoopStrategy) -> Result<SimulationResult, LoopError> {
        self.check_strategy(strategy)?;

        let loops = self.run_loops(strategy);
        let result = build_result(strategy, loops);

        if let Some(at) = result.target_breached_at {
            warn!(
                loop_index = at,
                target = strategy.health_factor_target,
                final_hf = result.health_factor,
                "Simulated position falls below health factor target"
            );
        }

        debug!(
            loops = result.loops.len(),
            collateral = result.collateral,
            debt = result.debt,
            hf = result.health_factor,
            "Simulation complete"
        );

        Ok(result)
    }

    /// Run the loop against a market snapshot.
    ///
    /// Amounts are in collateral-asset units and the borrowed asset is
    /// converted into collateral at snapshot value. Adds the liquidation
    /// price of the collateral asset and the net APY on the deposit.
    pub fn simulate_with_market(
        &self,
        strategy: &LoopStrategy,
        market: &MarketSnapshot,
    ) -> Result<SimulationResult, LoopError> {
        self.check_strategy(strategy)?;

        let lookup = |symbol: &str| {
            market.asset(symbol).ok_or_else(|| LoopError::AssetNotFound {
                symbol: symbol.to_string(),
                chain_id: market.chain_id,
            })
        };
        let collateral_asset = lookup(&strategy.assets.collateral)?;
        let borrow_asset = lookup(&strategy.assets.borrow)?;

        for asset in [collateral_asset, borrow_asset] {
            if !(asset.price > 0.0) {
                return Err(LoopError::invalid_strategy(format!(
                    "{} has no positive price on chain {}",
                    asset.symbol, market.chain_id
                )));
            }
        }

        let mut result = self.simulate(strategy)?;

        let p_c = collateral_asset.price;
        let p_b = borrow_asset.price;

        let collateral = BTreeMap::from([(collateral_asset.symbol.clone(), result.collateral)]);
        let debt = BTreeMap::from([(borrow_asset.symbol.clone(), result.debt * p_c / p_b)]);
        result.liquidation_price =
            risk::liquidation_price(&collateral, &debt, market).remove(&collateral_asset.symbol);

        let earned = result.collateral * p_c * collateral_asset.supply_apy;
        let paid = result.debt * p_c * borrow_asset.borrow_apy;
        result.total_apy = Some((earned - paid) / (strategy.initial_deposit * p_c));

        Ok(result)
    }

    fn run_loops(&self, strategy: &LoopStrategy) -> Vec<LoopIteration> {
        let mut loops = Vec::with_capacity(strategy.max_loops as usize);
        let mut collateral = strategy.initial_deposit;
        let mut debt = 0.0;

        for loop_index in 1..=strategy.max_loops {
            let borrowable = collateral * strategy.collateral_ratio - debt;
            let borrowed = borrowable * self.borrow_headroom;
            debt += borrowed;
            collateral += borrowed;

            loops.push(LoopIteration {
                loop_index,
                collateral,
                debt,
                health_factor: simple_health_factor(collateral, debt, strategy.collateral_ratio),
                borrowable,
                borrowed,
            });
        }

        loops
    }
}

fn build_result(strategy: &LoopStrategy, loops: Vec<LoopIteration>) -> SimulationResult {
    let (collateral, debt, health_factor) = loops
        .last()
        .map(|l| (l.collateral, l.debt, l.health_factor))
        .unwrap_or((strategy.initial_deposit, 0.0, f64::INFINITY));

    let target = strategy.health_factor_target;
    let target_breached_at = loops
        .iter()
        .find(|l| l.health_factor < target)
        .map(|l| l.loop_index);

    SimulationResult {
        collateral,
        debt,
        health_factor,
        loops,
        flash_loan_used: strategy.flash_loan_rescue,
        leverage: collateral / strategy.initial_deposit,
        health_factor_target: target,
        meets_target: risk::is_position_safe(health_factor, target),
        target_breached_at,
        liquidation_price: None,
        total_apy: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use looper_api::fallback_snapshot;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn example() -> LoopStrategy {
        LoopStrategy {
            initial_deposit: 100.0,
            collateral_ratio: 0.75,
            max_loops: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_worked_example() {
        let result = PositionSimulator::default().simulate(&example()).unwrap();
        let expected = [
            (75.0, 60.0, 60.0, 160.0, 2.0),
            (60.0, 48.0, 108.0, 208.0, 156.0 / 108.0),
            (48.0, 38.4, 146.4, 246.4, 184.8 / 146.4),
        ];

        assert_eq!(result.loops.len(), 3);
        for (iteration, (borrowable, borrowed, debt, collateral, hf)) in
            result.loops.iter().zip(expected)
        {
            assert!(close(iteration.borrowable, borrowable), "{iteration:?}");
            assert!(close(iteration.borrowed, borrowed), "{iteration:?}");
            assert!(close(iteration.debt, debt), "{iteration:?}");
            assert!(close(iteration.collateral, collateral), "{iteration:?}");
            assert!(close(iteration.health_factor, hf), "{iteration:?}");
        }

        assert!(close(result.collateral, 246.4));
        assert!(close(result.debt, 146.4));
        assert!((result.health_factor - 1.2623).abs() < 1e-4);
        assert!(result.flash_loan_used);
        assert!(close(result.leverage, 2.464));
        assert!(result.liquidation_price.is_none());
    }

    #[test]
    fn test_trajectory_length_and_monotonicity() {
        for max_loops in 1..=MAX_LOOPS {
            let strategy = LoopStrategy {
                max_loops,
                collateral_ratio: 0.6,
                ..Default::default()
            };
            let result = PositionSimulator::default().simulate(&strategy).unwrap();
            assert_eq!(result.loops.len(), max_loops as usize);

            for (i, pair) in result.loops.windows(2).enumerate() {
                assert!(pair[1].collateral > pair[0].collateral, "loop {i}");
                assert!(pair[1].debt > pair[0].debt, "loop {i}");
                assert!(pair[1].health_factor <= pair[0].health_factor, "loop {i}");
            }

            let last = result.loops.last().unwrap();
            assert_eq!(result.collateral, last.collateral);
            assert_eq!(result.debt, last.debt);
            assert_eq!(result.health_factor, last.health_factor);
            assert_eq!(last.loop_index, max_loops);
        }
    }

    #[test]
    fn test_target_reported_not_enforced() {
        let result = PositionSimulator::default().simulate(&example()).unwrap();
        assert!(!result.meets_target);
        assert_eq!(result.target_breached_at, Some(2));
        assert_eq!(result.loops.len(), 3);

        let relaxed = LoopStrategy {
            health_factor_target: 1.2,
            ..example()
        };
        let result = PositionSimulator::default().simulate(&relaxed).unwrap();
        assert!(result.meets_target);
        assert_eq!(result.target_breached_at, None);
    }

    #[test]
    fn test_invalid_strategies() {
        let cases = [
            LoopStrategy {
                initial_deposit: 0.0,
                ..example()
            },
            LoopStrategy {
                initial_deposit: -5.0,
                ..example()
            },
            LoopStrategy {
                initial_deposit: f64::NAN,
                ..example()
            },
            LoopStrategy {
                collateral_ratio: 0.0,
                ..example()
            },
            LoopStrategy {
                collateral_ratio: 1.01,
                ..example()
            },
            LoopStrategy {
                collateral_ratio: 1.5,
                ..example()
            },
            LoopStrategy {
                collateral_ratio: f64::INFINITY,
                ..example()
            },
            LoopStrategy {
                max_loops: 0,
                ..example()
            },
            LoopStrategy {
                max_loops: 11,
                ..example()
            },
            LoopStrategy {
                health_factor_target: 0.99,
                ..example()
            },
            LoopStrategy {
                health_factor_target: f64::NAN,
                ..example()
            },
        ];

        for strategy in cases {
            let err = PositionSimulator::default().simulate(&strategy).unwrap_err();
            assert!(matches!(err, LoopError::InvalidStrategy { .. }), "{strategy:?}: {err}");
        }
    }

    #[test]
    fn test_max_health_factor_target() {
        let simulator = PositionSimulator::default().with_max_health_factor_target(3.0);
        let strategy = LoopStrategy {
            health_factor_target: 3.0,
            ..example()
        };
        assert!(simulator.simulate(&strategy).is_ok());

        let strategy = LoopStrategy {
            health_factor_target: 3.5,
            ..example()
        };
        let err = simulator.simulate(&strategy).unwrap_err();
        assert!(matches!(err, LoopError::InvalidStrategy { .. }), "{err}");

        let market = fallback_snapshot(1, Utc::now());
        let err = simulator.simulate_with_market(&strategy, &market).unwrap_err();
        assert!(matches!(err, LoopError::InvalidStrategy { .. }), "{err}");

        // Unbounded without a configured maximum
        assert!(PositionSimulator::default().simulate(&strategy).is_ok());
    }

    #[test]
    fn test_boundary_strategies_accepted() {
        let strategy = LoopStrategy {
            collateral_ratio: 1.0,
            max_loops: MAX_LOOPS,
            health_factor_target: 1.0,
            ..example()
        };
        assert!(PositionSimulator::default().simulate(&strategy).is_ok());
    }

    #[test]
    fn test_headroom_validated() {
        for headroom in [0.0, 1.5, f64::NAN] {
            let config = SimulationConfig {
                borrow_headroom: headroom,
            };
            assert!(matches!(PositionSimulator::new(&config), Err(LoopError::Config(_))));
        }

        let config = SimulationConfig {
            borrow_headroom: 1.0,
        };
        let result = PositionSimulator::new(&config).unwrap().simulate(&example()).unwrap();
        assert!(close(result.loops[0].borrowed, 75.0));
    }

    #[test]
    fn test_simulate_with_market() {
        let market = fallback_snapshot(1, Utc::now());
        let result = PositionSimulator::default()
            .simulate_with_market(&example(), &market)
            .unwrap();

        // debt 146.4 ETH-equivalent = 292_800 USDC; collateral 246.4 ETH at LT 0.82
        let expected_liq = 146.4 * 2000.0 / (246.4 * 0.82);
        assert!((result.liquidation_price.unwrap() - expected_liq).abs() < 1e-6);

        let expected_apy = (246.4 * 0.02 - 146.4 * 0.05) / 100.0;
        assert!((result.total_apy.unwrap() - expected_apy).abs() < 1e-9);
    }

    #[test]
    fn test_simulate_with_market_unknown_asset() {
        let market = fallback_snapshot(1, Utc::now());
        let strategy = LoopStrategy {
            assets: StrategyAssets {
                collateral: "WBTC".to_string(),
                borrow: "USDC".to_string(),
            },
            ..example()
        };

        let err = PositionSimulator::default()
            .simulate_with_market(&strategy, &market)
            .unwrap_err();
        assert_eq!(
            err,
            LoopError::AssetNotFound {
                symbol: "WBTC".to_string(),
                chain_id: 1
            }
        );
    }

    #[test]
    fn test_strategy_wire_format() {
        let json = r#"{
            "initialDeposit": 10,
            "collateralRatio": 0.5,
            "maxLoops": 2,
            "healthFactorTarget": 1.5,
            "flashLoanRescue": false,
            "assets": { "collateral": "WBTC", "borrow": "USDC" }
        }"#;
        let strategy: LoopStrategy = serde_json::from_str(json).unwrap();
        assert_eq!(strategy.max_loops, 2);
        assert_eq!(strategy.assets.collateral, "WBTC");

        let result = PositionSimulator::default().simulate(&strategy).unwrap();
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["flashLoanUsed"], false);
        assert!(value["loops"][0].get("loopIndex").is_some());
        assert!(value.get("totalAPY").is_some());
    }
}
