//! Settlement layer for atomic flash-loan sequences.
//!
//! This crate provides:
//! - Flash-loan action definitions (borrow / repay / swap)
//! - Settlement backend and session traits (the per-action `apply` seam)
//! - In-memory ledger backend for previews and tests
//!
//! Nothing here signs or broadcasts transactions; a real settlement backend
//! plugs in behind [`SettlementBackend`].

mod action;
mod ledger;
mod settlement;

pub use action::{ActionKind, FlashLoanAction, SequenceToken, SettlementOp};
pub use ledger::{LedgerBackend, LedgerState};
pub use settlement::{
    AppliedOp, CommitOutcome, CommittedSequence, SettlementBackend, SettlementSession,
};
