//! Position error types.

use lotbot_core::{CoreError, GroupId, PositionId};
use thiserror::Error;

/// Risk engine errors.
#[derive(Debug, Error)]
pub enum PositionError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Risk engine is shutting down")]
    ShuttingDown,
}

pub type PositionResult<T> = Result<T, PositionError>;

/// Rejected reconciler operations.
///
/// Report outcomes that do not match any lot are not errors; see
/// [`crate::MatchOutcome`].
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Invalid group: {0}")]
    InvalidGroup(#[from] CoreError),

    #[error("Group not found: {0}")]
    GroupNotFound(GroupId),

    #[error("Position not found: {0}")]
    PositionNotFound(PositionId),

    #[error("Group {0} is not open")]
    GroupNotOpen(GroupId),

    #[error("Lot capacity exceeded for {group_id}: requested {requested}, available {available}")]
    LotCapacityExceeded {
        group_id: GroupId,
        requested: u8,
        available: u8,
    },

    #[error("Invalid lot state: {0}")]
    InvalidLotState(String),

    #[error("Retry limit exceeded for position {0}")]
    RetryLimitExceeded(PositionId),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
