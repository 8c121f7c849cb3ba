//! Settlement backend abstraction.
//!
//! A backend opens an isolated session per atomic sequence. Operations are
//! applied to the session one at a time; nothing is observable outside the
//! session until [`SettlementSession::commit`] succeeds. Dropping or rolling
//! back a session discards every staged effect.

use anyhow::Result;
use async_trait::async_trait;
use looper_api::MarketSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::action::{SequenceToken, SettlementOp};

/// Result of applying one operation inside a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOp {
    /// The operation as applied
    pub op: SettlementOp,
    /// Amount of the target asset received (swaps only)
    pub received: Option<f64>,
}

/// Outcome of committing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOutcome {
    /// Effects were written
    Committed,
    /// The token was already committed; nothing was written
    Replayed,
}

/// What a backend remembers about a committed sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedSequence {
    /// Backend version the commit produced
    pub version: u64,
    /// Operations as they were applied
    pub applied: Vec<AppliedOp>,
    /// Wallet balances right after the commit
    pub balances: BTreeMap<String, f64>,
}

/// Backend that settles atomic sequences.
#[async_trait]
pub trait SettlementBackend: Send + Sync + Debug {
    /// Record of a sequence already committed under `token`, if any.
    async fn committed(&self, token: &SequenceToken) -> Result<Option<CommittedSequence>>;

    /// Open an isolated session for one sequence.
    async fn begin(&self, token: &SequenceToken) -> Result<Box<dyn SettlementSession>>;
}

/// Isolated, all-or-nothing unit of work.
#[async_trait]
pub trait SettlementSession: Send {
    /// Apply one operation to the staged state.
    async fn apply(&mut self, op: &SettlementOp, market: &MarketSnapshot) -> Result<AppliedOp>;

    /// Staged wallet balances, if the backend can report them.
    fn balances(&self) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }

    /// Publish every staged effect.
    async fn commit(self: Box<Self>) -> Result<CommitOutcome>;

    /// Discard every staged effect.
    async fn rollback(self: Box<Self>);
}
