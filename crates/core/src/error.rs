use looper_chain::ActionKind;
use thiserror::Error;

/// Typed error taxonomy for the simulation core.
///
/// Every variant is recoverable by the caller. `MarketDataUnavailable` is
/// never returned as an `Err`; it is attached to a successful market-data
/// response as a warning.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoopError {
    // -- Input --------------------------------------------------------------
    #[error("invalid strategy: {reason}")]
    InvalidStrategy { reason: String },

    #[error("invalid action{}: {reason}", at_index(.index))]
    InvalidAction { index: Option<usize>, reason: String },

    // -- Market data --------------------------------------------------------
    #[error("market data unavailable for chain {chain_id}: {reason}")]
    MarketDataUnavailable { chain_id: u64, reason: String },

    #[error("asset {symbol} not found on chain {chain_id}")]
    AssetNotFound { symbol: String, chain_id: u64 },

    // -- Execution ----------------------------------------------------------
    #[error("action {index} ({kind}) failed: {reason}")]
    ActionFailed {
        index: usize,
        kind: ActionKind,
        reason: String,
    },

    #[error("settlement backend error: {reason}")]
    Settlement { reason: String },

    // -- Configuration ------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),
}

fn at_index(index: &Option<usize>) -> String {
    index.map(|i| format!(" at index {i}")).unwrap_or_default()
}

impl LoopError {
    pub(crate) fn invalid_strategy(reason: impl Into<String>) -> Self {
        Self::InvalidStrategy {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = LoopError::ActionFailed {
            index: 2,
            kind: ActionKind::Repay,
            reason: "exceeds debt".to_string(),
        };
        assert_eq!(err.to_string(), "action 2 (repay) failed: exceeds debt");

        let err = LoopError::InvalidAction {
            index: None,
            reason: "bad principal".to_string(),
        };
        assert_eq!(err.to_string(), "invalid action: bad principal");

        let err = LoopError::InvalidAction {
            index: Some(1),
            reason: "amount".to_string(),
        };
        assert_eq!(err.to_string(), "invalid action at index 1: amount");
    }
}
