//! Leverage loop simulation core.
//!
//! This crate provides:
//! - Runtime configuration with profiles
//! - Cached market data access with single-flight refetch and fallback
//! - Health factor and liquidation price calculations
//! - The bounded leverage loop simulator
//! - Atomic execution of flash-loan action sequences

pub mod clock;
pub mod config;
mod error;
mod market_data;
pub mod risk;
mod sequencer;
mod simulator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LooperConfig;
pub use error::LoopError;
pub use market_data::{MarketData, MarketDataProvider, SnapshotSource};
pub use risk::{Position, RiskAssessment, RiskCalculator, RiskTier};
pub use sequencer::{ActionSequencer, AtomicReceipt, Principal};
pub use simulator::{
    LoopIteration, LoopStrategy, PositionSimulator, SimulationResult, StrategyAssets, MAX_LOOPS,
};
