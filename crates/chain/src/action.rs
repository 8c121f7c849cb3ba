//! Flash-loan action definitions.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sub-operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Borrow,
    Repay,
    Swap,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Borrow => f.write_str("borrow"),
            Self::Repay => f.write_str("repay"),
            Self::Swap => f.write_str("swap"),
        }
    }
}

/// One step of a flash-loan sequence, as supplied by the caller.
///
/// Amounts are decimal strings; they are validated before any step runs.
/// Wire form: `{"action": "swap", "asset": "ETH", "amount": "1", "targetAsset": "USDC"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum FlashLoanAction {
    /// Increase outstanding debt for `asset`
    Borrow { asset: String, amount: String },
    /// Decrease outstanding debt for `asset`
    Repay { asset: String, amount: String },
    /// Convert `amount` of `asset` into `target_asset` at snapshot prices
    Swap {
        asset: String,
        amount: String,
        #[serde(rename = "targetAsset")]
        target_asset: String,
    },
}

impl FlashLoanAction {
    pub fn borrow(asset: impl Into<String>, amount: impl Into<String>) -> Self {
        Self::Borrow {
            asset: asset.into(),
            amount: amount.into(),
        }
    }

    pub fn repay(asset: impl Into<String>, amount: impl Into<String>) -> Self {
        Self::Repay {
            asset: asset.into(),
            amount: amount.into(),
        }
    }

    pub fn swap(
        asset: impl Into<String>,
        amount: impl Into<String>,
        target_asset: impl Into<String>,
    ) -> Self {
        Self::Swap {
            asset: asset.into(),
            amount: amount.into(),
            target_asset: target_asset.into(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Borrow { .. } => ActionKind::Borrow,
            Self::Repay { .. } => ActionKind::Repay,
            Self::Swap { .. } => ActionKind::Swap,
        }
    }

    pub fn asset(&self) -> &str {
        match self {
            Self::Borrow { asset, .. }
            | Self::Repay { asset, .. }
            | Self::Swap { asset, .. } => asset,
        }
    }

    /// Raw amount string.
    pub fn amount(&self) -> &str {
        match self {
            Self::Borrow { amount, .. }
            | Self::Repay { amount, .. }
            | Self::Swap { amount, .. } => amount,
        }
    }

    /// Build the settlement operation once the amount has been parsed.
    pub fn with_amount(&self, amount: f64) -> SettlementOp {
        match self {
            Self::Borrow { asset, .. } => SettlementOp::Borrow {
                asset: asset.clone(),
                amount,
            },
            Self::Repay { asset, .. } => SettlementOp::Repay {
                asset: asset.clone(),
                amount,
            },
            Self::Swap {
                asset,
                target_asset,
                ..
            } => SettlementOp::Swap {
                asset: asset.clone(),
                amount,
                target_asset: target_asset.clone(),
            },
        }
    }
}

/// Validated operation handed to a settlement session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SettlementOp {
    Borrow {
        asset: String,
        amount: f64,
    },
    Repay {
        asset: String,
        amount: f64,
    },
    Swap {
        asset: String,
        amount: f64,
        #[serde(rename = "targetAsset")]
        target_asset: String,
    },
}

impl SettlementOp {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Borrow { .. } => ActionKind::Borrow,
            Self::Repay { .. } => ActionKind::Repay,
            Self::Swap { .. } => ActionKind::Swap,
        }
    }

    pub fn asset(&self) -> &str {
        match self {
            Self::Borrow { asset, .. }
            | Self::Repay { asset, .. }
            | Self::Swap { asset, .. } => asset,
        }
    }

    pub fn amount(&self) -> f64 {
        match self {
            Self::Borrow { amount, .. }
            | Self::Repay { amount, .. }
            | Self::Swap { amount, .. } => *amount,
        }
    }
}

/// Opaque caller-supplied sequencing / idempotency token.
///
/// A backend that has already committed a sequence under a token
/// acknowledges a repeat as a replay instead of applying it twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceToken(String);

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

impl SequenceToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Process-unique token for callers that don't need idempotency.
    pub fn unique() -> Self {
        let seq = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        Self(format!("seq-{nanos:x}-{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
