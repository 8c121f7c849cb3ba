//! Configuration for the leverage loop simulator.
//!
//! This module provides:
//! - Runtime configuration (profiles, cache timing, risk thresholds)
//! - Chain selection and the market-data endpoint
//! - Known network descriptions

mod network;
mod settings;

pub use network::{network, ChainConfig, Network, NETWORKS};
pub use settings::{
    FeatureFlags, LooperConfig, MarketConfig, RiskConfig, SimulationConfig,
    DEFAULT_BORROW_HEADROOM,
};
