//! Lot reconciliation and per-position exit risk for lotbot.
//!
//! # Key Components
//!
//! - [`FifoReconciler`]: Maps anonymous broker fill/cancel reports onto the
//!   oldest unmatched lot of the oldest matching strategy group
//! - [`MatchOutcome`]: Per-unit result of applying a report
//! - [`PositionRiskEngine`]: Initial, trailing and protective stop state machine,
//!   triggering an injected [`ExitExecutor`] at most once per position
//! - [`RiskConfig`], [`LotRule`]: Stop parameters per lot number

pub mod error;
pub mod reconcile;
pub mod risk;

pub use error::{PositionError, PositionResult, ReconcileError, ReconcileResult};
pub use reconcile::{
    CancelledGroup, FifoReconciler, FillMatch, MatchOutcome, ReconcileConfig, ReleaseMatch,
    SubmitResult,
};
pub use risk::{
    BoxFuture, Evaluation, ExitExecutor, ExitResult, ExitTrigger, LockKey, LotRule,
    PositionRiskEngine, RiskConfig,
};
