//! In-memory ledger backend.
//!
//! Tracks wallet balances and outstanding debt per asset symbol. Each session
//! works on a private copy of the ledger; commit publishes the copy only if
//! the ledger has not changed since the session began.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use looper_api::MarketSnapshot;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::action::{SequenceToken, SettlementOp};
use crate::settlement::{
    AppliedOp, CommitOutcome, CommittedSequence, SettlementBackend, SettlementSession,
};

/// Amounts below this are treated as zero.
const DUST: f64 = 1e-9;

/// Balances and debts keyed by asset symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub balances: BTreeMap<String, f64>,
    pub debts: BTreeMap<String, f64>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(mut self, asset: impl Into<String>, amount: f64) -> Self {
        self.balances.insert(asset.into(), amount);
        self
    }

    pub fn with_debt(mut self, asset: impl Into<String>, amount: f64) -> Self {
        self.debts.insert(asset.into(), amount);
        self
    }

    pub fn balance(&self, asset: &str) -> f64 {
        self.balances.get(asset).copied().unwrap_or(0.0)
    }

    pub fn debt(&self, asset: &str) -> f64 {
        self.debts.get(asset).copied().unwrap_or(0.0)
    }

    fn credit(&mut self, asset: &str, amount: f64) {
        *self.balances.entry(asset.to_string()).or_insert(0.0) += amount;
    }

    fn debit(&mut self, asset: &str, amount: f64) -> Result<()> {
        let available = self.balance(asset);
        if amount - available > DUST {
            anyhow::bail!("insufficient {asset} balance: need {amount}, have {available}");
        }
        set_or_remove(&mut self.balances, asset, available - amount);
        Ok(())
    }

    /// Apply one operation, leaving the state untouched on error.
    pub fn apply(&mut self, op: &SettlementOp, market: &MarketSnapshot) -> Result<AppliedOp> {
        let received = match op {
            SettlementOp::Borrow { asset, amount } => {
                *self.debts.entry(asset.clone()).or_insert(0.0) += amount;
                self.credit(asset, *amount);
                None
            }
            SettlementOp::Repay { asset, amount } => {
                let outstanding = self.debt(asset);
                if amount - outstanding > DUST {
                    anyhow::bail!(
                        "repay {amount} {asset} exceeds outstanding debt {outstanding}"
                    );
                }
                self.debit(asset, *amount)?;
                set_or_remove(&mut self.debts, asset, outstanding - amount);
                None
            }
            SettlementOp::Swap {
                asset,
                amount,
                target_asset,
            } => {
                if asset == target_asset {
                    anyhow::bail!("cannot swap {asset} into itself");
                }
                let price_in = positive_price(market, asset)?;
                let price_out = positive_price(market, target_asset)?;
                let out = amount * price_in / price_out;

                self.debit(asset, *amount)?;
                self.credit(target_asset, out);
                Some(out)
            }
        };

        Ok(AppliedOp {
            op: op.clone(),
            received,
        })
    }
}

fn set_or_remove(map: &mut BTreeMap<String, f64>, asset: &str, value: f64) {
    if value.abs() <= DUST {
        map.remove(asset);
    } else {
        map.insert(asset.to_string(), value);
    }
}

fn positive_price(market: &MarketSnapshot, symbol: &str) -> Result<f64> {
    match market.price(symbol) {
        Some(price) if price > 0.0 => Ok(price),
        Some(price) => anyhow::bail!("{symbol} has non-positive price {price}"),
        None => anyhow::bail!("{symbol} not listed on chain {}", market.chain_id),
    }
}

#[derive(Debug)]
struct Versioned {
    state: LedgerState,
    version: u64,
}

/// Ledger backend held in memory.
#[derive(Debug, Clone)]
pub struct LedgerBackend {
    inner: Arc<RwLock<Versioned>>,
    committed: Arc<DashMap<SequenceToken, CommittedSequence>>,
}

impl Default for LedgerBackend {
    fn default() -> Self {
        Self::new(LedgerState::default())
    }
}

impl LedgerBackend {
    pub fn new(initial: LedgerState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Versioned {
                state: initial,
                version: 0,
            })),
            committed: Arc::new(DashMap::new()),
        }
    }

    /// Copy of the current committed state.
    pub fn state(&self) -> LedgerState {
        self.inner.read().state.clone()
    }

    /// Number of commits so far.
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    pub fn balance(&self, asset: &str) -> f64 {
        self.inner.read().state.balance(asset)
    }

    pub fn debt(&self, asset: &str) -> f64 {
        self.inner.read().state.debt(asset)
    }

    pub fn is_committed(&self, token: &SequenceToken) -> bool {
        self.committed.contains_key(token)
    }
}

#[async_trait]
impl SettlementBackend for LedgerBackend {
    async fn committed(&self, token: &SequenceToken) -> Result<Option<CommittedSequence>> {
        Ok(self.committed.get(token).map(|entry| entry.value().clone()))
    }

    async fn begin(&self, token: &SequenceToken) -> Result<Box<dyn SettlementSession>> {
        let (staged, base_version) = {
            let guard = self.inner.read();
            (guard.state.clone(), guard.version)
        };

        debug!(token = %token, base_version, "Opened ledger session");

        Ok(Box::new(LedgerSession {
            token: token.clone(),
            staged,
            applied: Vec::new(),
            base_version,
            inner: Arc::clone(&self.inner),
            committed: Arc::clone(&self.committed),
        }))
    }
}

struct LedgerSession {
    token: SequenceToken,
    staged: LedgerState,
    applied: Vec<AppliedOp>,
    base_version: u64,
    inner: Arc<RwLock<Versioned>>,
    committed: Arc<DashMap<SequenceToken, CommittedSequence>>,
}

#[async_trait]
impl SettlementSession for LedgerSession {
    async fn apply(&mut self, op: &SettlementOp, market: &MarketSnapshot) -> Result<AppliedOp> {
        // Work on a scratch copy so a failing op leaves the staged state intact.
        let mut next = self.staged.clone();
        let applied = next.apply(op, market)?;
        self.staged = next;
        self.applied.push(applied.clone());
        Ok(applied)
    }

    fn balances(&self) -> BTreeMap<String, f64> {
        self.staged.balances.clone()
    }

    async fn commit(self: Box<Self>) -> Result<CommitOutcome> {
        let this = *self;
        let mut guard = this.inner.write();

        if let Some(record) = this.committed.get(&this.token) {
            info!(
                token = %this.token,
                version = record.version,
                "Sequence already committed, replay ignored"
            );
            return Ok(CommitOutcome::Replayed);
        }

        if guard.version != this.base_version {
            anyhow::bail!(
                "ledger changed during session (base version {}, now {})",
                this.base_version,
                guard.version
            );
        }

        let record = CommittedSequence {
            version: guard.version + 1,
            applied: this.applied,
            balances: this.staged.balances.clone(),
        };
        guard.state = this.staged;
        guard.version = record.version;
        this.committed.insert(this.token.clone(), record);

        debug!(token = %this.token, version = guard.version, "Committed ledger session");
        Ok(CommitOutcome::Committed)
    }

    async fn rollback(self: Box<Self>) {
        debug!(token = %self.token, "Rolled back ledger session");
    }
}
