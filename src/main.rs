//! Leverage Loop Simulator
//!
//! Previews a recursive supply/borrow/swap leverage loop against live (or
//! static) lending market parameters and prints the trajectory, the final
//! risk assessment and, when enabled, a flash-loan deleveraging preview as
//! JSON on stdout. Logs go to stderr.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use looper_api::{AaveGraphClient, Asset, MarketDataFetcher, MarketSnapshot, StaticMarketFetcher};
use looper_chain::{FlashLoanAction, LedgerBackend, LedgerState, SequenceToken};
use looper_core::{
    risk, ActionSequencer, AtomicReceipt, LoopStrategy, LooperConfig, MarketDataProvider, Position,
    PositionSimulator, RiskAssessment, RiskCalculator, SimulationResult, SnapshotSource,
};

/// Environment variable names.
mod env {
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
    pub const STRATEGY: &str = "LOOPER_STRATEGY";
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    profile: String,
    chain_id: u64,
    market_source: SnapshotSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    market_warning: Option<String>,
    strategy: LoopStrategy,
    result: SimulationResult,
    risk: RiskAssessment,
    #[serde(skip_serializing_if = "Option::is_none")]
    rescue: Option<RescuePreview>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RescuePreview {
    receipt: AtomicReceipt,
    health_factor_before: f64,
    health_factor_after: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // LOOPER_PROFILE selects: default, conservative, aggressive, or a TOML path
    let config = LooperConfig::from_env()?;
    config.log_config();

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!(%problem, "Invalid configuration");
        }
        anyhow::bail!("configuration has {} problem(s)", problems.len());
    }

    if !config.features.simulation {
        info!("Simulation disabled (ENABLE_SIMULATION=false), nothing to do");
        return Ok(());
    }

    let strategy = load_strategy(&config)?;
    let chain_id = config.chain.chain_id;

    let provider = MarketDataProvider::from_config(build_fetcher(&config), &config.market);
    let market = provider.get_snapshot(chain_id).await;
    if let Some(warning) = &market.warning {
        warn!(source = ?market.source, %warning, "Using degraded market data");
    }

    let simulator = PositionSimulator::new(&config.simulation)?
        .with_max_health_factor_target(config.risk.max_health_factor);
    let result = simulator.simulate_with_market(&strategy, &market.snapshot)?;

    info!(
        loops = result.loops.len(),
        leverage = result.leverage,
        hf = result.health_factor,
        meets_target = result.meets_target,
        "Simulation finished"
    );

    let (collateral_asset, borrow_asset) = loop_pair(&strategy, &market.snapshot)?;
    let position = final_position(&result, collateral_asset, borrow_asset);
    let assessment = RiskCalculator::new(config.risk.clone()).assess(&position, &market.snapshot);
    if assessment.leverage_exceeded {
        warn!(
            leverage = assessment.leverage,
            max = config.risk.max_leverage,
            "Simulated position exceeds max leverage"
        );
    }
    if assessment.buffer_breached {
        warn!(
            hf = assessment.health_factor,
            buffer = config.risk.liquidation_buffer,
            "Simulated position inside liquidation buffer"
        );
    }

    let wants_rescue = strategy.flash_loan_rescue && !result.meets_target;
    let rescue = if config.features.flash_loans && wants_rescue {
        preview_rescue(&position, &strategy, &market.snapshot).await?
    } else {
        None
    };

    let report = Report {
        profile: config.profile.clone(),
        chain_id,
        market_source: market.source,
        market_warning: market.warning.as_ref().map(ToString::to_string),
        strategy,
        result,
        risk: assessment,
        rescue,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,looper_core=debug"));

    let json = std::env::var(env::LOG_FORMAT)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

/// Strategy from `LOOPER_STRATEGY` (JSON), else the profile's strategy.
fn load_strategy(config: &LooperConfig) -> Result<LoopStrategy> {
    match std::env::var(env::STRATEGY) {
        Ok(raw) if !raw.trim().is_empty() => {
            serde_json::from_str(&raw).with_context(|| format!("invalid {}", env::STRATEGY))
        }
        _ => Ok(config.strategy.clone()),
    }
}

fn build_fetcher(config: &LooperConfig) -> Arc<dyn MarketDataFetcher> {
    match &config.chain.graph_api_url {
        Some(url) => {
            info!(url = %url, "Using Aave subgraph market data");
            Arc::new(
                AaveGraphClient::new(url.clone())
                    .with_api_key(config.chain.graph_api_key.clone())
                    .with_timeout(config.market.fetch_timeout()),
            )
        }
        None => {
            info!("No GRAPH_API_URL configured, using static market data");
            Arc::new(StaticMarketFetcher::new())
        }
    }
}

fn loop_pair<'a>(
    strategy: &LoopStrategy,
    market: &'a MarketSnapshot,
) -> Result<(&'a Asset, &'a Asset)> {
    let find = |symbol: &str| {
        market
            .asset(symbol)
            .with_context(|| format!("{} not listed on chain {}", symbol, market.chain_id))
    };
    Ok((find(&strategy.assets.collateral)?, find(&strategy.assets.borrow)?))
}

/// Final simulated position in token units of each asset.
fn final_position(result: &SimulationResult, collateral: &Asset, borrow: &Asset) -> Position {
    // Simulated amounts are collateral-denominated.
    let debt_in_borrow_units = result.debt * collateral.price / borrow.price;
    Position::new()
        .with_collateral(collateral.symbol.clone(), result.collateral)
        .with_debt(borrow.symbol.clone(), debt_in_borrow_units)
}

/// Preview a flash-loan deleverage that brings the position back to its
/// health factor target.
///
/// Sequence: flash-borrow the debt asset, repay part of the position debt,
/// sell collateral for the debt asset, repay the flash loan. Collateral is
/// modelled as a wallet balance in the in-memory ledger.
async fn preview_rescue(
    position: &Position,
    strategy: &LoopStrategy,
    market: &MarketSnapshot,
) -> Result<Option<RescuePreview>> {
    let (collateral, borrow) = loop_pair(strategy, market)?;
    if collateral.symbol == borrow.symbol {
        return Ok(None);
    }

    let collateral_amount = position.collateral.get(&collateral.symbol).copied().unwrap_or(0.0);
    let debt_amount = position.debt.get(&borrow.symbol).copied().unwrap_or(0.0);
    let target = strategy.health_factor_target;
    let lt = collateral.liquidation_threshold;

    // Debt value v to repay so that (C - v) * LT / (D - v) == target
    let collateral_value = collateral_amount * collateral.price;
    let debt_value = debt_amount * borrow.price;
    let repay_value = (target * debt_value - collateral_value * lt) / (target - lt);
    if !(repay_value > 0.0 && repay_value < collateral_value && repay_value < debt_value) {
        warn!(repay_value, "No feasible deleverage for this position");
        return Ok(None);
    }

    let repay = format!("{:.6}", repay_value / borrow.price);
    let repay_amount: f64 = repay.parse()?;
    let sell = repay_amount * borrow.price / collateral.price;
    let sell = format!("{:.9}", (sell * 1e9).ceil() / 1e9);

    let actions = vec![
        FlashLoanAction::borrow(&borrow.symbol, &repay),
        FlashLoanAction::repay(&borrow.symbol, &repay),
        FlashLoanAction::swap(&collateral.symbol, &sell, &borrow.symbol),
        FlashLoanAction::repay(&borrow.symbol, &repay),
    ];

    let ledger = LedgerBackend::new(
        LedgerState::new()
            .with_balance(collateral.symbol.clone(), collateral_amount)
            .with_debt(borrow.symbol.clone(), debt_amount),
    );
    let sequencer = ActionSequencer::new(Arc::new(ledger.clone()))?;
    let receipt = sequencer
        .execute_atomic(&borrow.symbol, &repay, &actions, SequenceToken::unique(), market)
        .await?;

    let after_collateral = BTreeMap::from([(
        collateral.symbol.clone(),
        ledger.balance(&collateral.symbol),
    )]);
    let after_debt = BTreeMap::from([(borrow.symbol.clone(), ledger.debt(&borrow.symbol))]);

    let preview = RescuePreview {
        health_factor_before: risk::health_factor(&position.collateral, &position.debt, market),
        health_factor_after: risk::health_factor(&after_collateral, &after_debt, market),
        receipt,
    };

    info!(
        before = preview.health_factor_before,
        after = preview.health_factor_after,
        repaid = %repay,
        "Flash loan rescue preview"
    );

    Ok(Some(preview))
}
