//! Atomic execution of flash-loan action sequences.

use looper_api::MarketSnapshot;
use looper_chain::{
    AppliedOp, CommitOutcome, CommittedSequence, FlashLoanAction, SequenceToken,
    SettlementBackend, SettlementOp,
};
use regex_lite::Regex;
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::LoopError;

/// Flash-loan principal, validated and recorded with the receipt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Principal {
    pub asset: String,
    pub amount: f64,
}

/// Result of a committed (or replayed) sequence.
#[derive(Debug, Clone, Serialize)]
pub struct AtomicReceipt {
    pub token: SequenceToken,
    pub principal: Principal,
    /// Operations written under this token. For a replay, the ones recorded
    /// by the original commit.
    pub applied: SmallVec<[AppliedOp; 8]>,
    /// Wallet balances right after the commit
    pub balances: BTreeMap<String, f64>,
    pub outcome: CommitOutcome,
}

/// Executes ordered borrow/repay/swap sequences as a single unit.
#[derive(Debug, Clone)]
pub struct ActionSequencer {
    backend: Arc<dyn SettlementBackend>,
    amounts: AmountValidator,
}

impl ActionSequencer {
    pub fn new(backend: Arc<dyn SettlementBackend>) -> Result<Self, LoopError> {
        Ok(Self {
            backend,
            amounts: AmountValidator::new()?,
        })
    }

    /// Run every action in order, or none of them.
    ///
    /// All amounts are validated before the backend is touched. A token the
    /// backend already committed is answered from its record without applying
    /// anything. On the first failing action the session is rolled back and
    /// the error names the action's position and kind.
    #[instrument(skip(self, actions, market), fields(actions = actions.len()))]
    pub async fn execute_atomic(
        &self,
        asset: &str,
        amount: &str,
        actions: &[FlashLoanAction],
        token: SequenceToken,
        market: &MarketSnapshot,
    ) -> Result<AtomicReceipt, LoopError> {
        let principal = Principal {
            asset: non_empty(asset, None)?.to_string(),
            amount: self.amounts.parse(amount, None)?,
        };
        let ops = validate_actions(&self.amounts, actions)?;

        if let Some(record) = self.committed(&token).await? {
            info!(
                token = %token,
                version = record.version,
                "Sequence already committed, replaying receipt"
            );
            return Ok(replay_receipt(token, principal, record));
        }

        let mut session = self.backend.begin(&token).await.map_err(settlement_error)?;

        let mut applied = SmallVec::<[AppliedOp; 8]>::new();
        for (index, op) in ops.iter().enumerate() {
            match session.apply(op, market).await {
                Ok(result) => {
                    debug!(
                        index,
                        kind = %op.kind(),
                        asset = op.asset(),
                        amount = op.amount(),
                        "Action applied"
                    );
                    applied.push(result);
                }
                Err(e) => {
                    session.rollback().await;
                    warn!(
                        token = %token,
                        index,
                        kind = %op.kind(),
                        error = %e,
                        "Sequence rolled back"
                    );
                    return Err(LoopError::ActionFailed {
                        index,
                        kind: op.kind(),
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        let balances = session.balances();
        let outcome = session.commit().await.map_err(settlement_error)?;

        // Another call committed the same token while this one was running.
        if outcome == CommitOutcome::Replayed {
            if let Some(record) = self.committed(&token).await? {
                return Ok(replay_receipt(token, principal, record));
            }
        }

        info!(
            token = %token,
            principal_asset = %principal.asset,
            principal_amount = principal.amount,
            actions = applied.len(),
            ?outcome,
            "Flash loan sequence settled"
        );

        Ok(AtomicReceipt {
            token,
            principal,
            applied,
            balances,
            outcome,
        })
    }

    async fn committed(
        &self,
        token: &SequenceToken,
    ) -> Result<Option<CommittedSequence>, LoopError> {
        self.backend.committed(token).await.map_err(settlement_error)
    }
}

fn replay_receipt(
    token: SequenceToken,
    principal: Principal,
    record: CommittedSequence,
) -> AtomicReceipt {
    AtomicReceipt {
        token,
        principal,
        applied: SmallVec::from_vec(record.applied),
        balances: record.balances,
        outcome: CommitOutcome::Replayed,
    }
}

fn settlement_error(e: anyhow::Error) -> LoopError {
    LoopError::Settlement {
        reason: format!("{:#}", e),
    }
}

#[derive(Debug, Clone)]
struct AmountValidator {
    decimal: Regex,
}

impl AmountValidator {
    fn new() -> Result<Self, LoopError> {
        let decimal = Regex::new(r"^[0-9]+(\.[0-9]+)?$")
            .map_err(|e| LoopError::Config(format!("amount pattern: {e}")))?;
        Ok(Self { decimal })
    }

    /// Positive, finite, plain decimal notation.
    fn parse(&self, raw: &str, index: Option<usize>) -> Result<f64, LoopError> {
        let invalid = |reason: String| LoopError::InvalidAction { index, reason };

        let trimmed = raw.trim();
        if !self.decimal.is_match(trimmed) {
            return Err(invalid(format!("malformed amount '{raw}'")));
        }
        match trimmed.parse::<f64>() {
            Ok(value) if value.is_finite() && value > 0.0 => Ok(value),
            Ok(_) => Err(invalid(format!("amount '{raw}' must be positive"))),
            Err(e) => Err(invalid(format!("malformed amount '{raw}': {e}"))),
        }
    }
}

fn non_empty(symbol: &str, index: Option<usize>) -> Result<&str, LoopError> {
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return Err(LoopError::InvalidAction {
            index,
            reason: "asset symbol is empty".to_string(),
        });
    }
    Ok(symbol)
}

fn validate_actions(
    validator: &AmountValidator,
    actions: &[FlashLoanAction],
) -> Result<SmallVec<[SettlementOp; 8]>, LoopError> {
    if actions.is_empty() {
        return Err(LoopError::InvalidAction {
            index: None,
            reason: "sequence contains no actions".to_string(),
        });
    }

    actions
        .iter()
        .enumerate()
        .map(|(index, action)| {
            non_empty(action.asset(), Some(index))?;
            if let FlashLoanAction::Swap { target_asset, .. } = action {
                non_empty(target_asset, Some(index))?;
            }
            let amount = validator.parse(action.amount(), Some(index))?;
            Ok(action.with_amount(amount))
        })
        .collect()
}
