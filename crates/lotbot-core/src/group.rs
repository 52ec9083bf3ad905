//! Strategy groups: multi-lot entries opened on one breakout signal.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;
use crate::{Direction, GroupId, Price, ProductCode, MAX_LOTS_PER_GROUP};

/// Lifecycle of a strategy group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupStatus {
    Open,
    Complete,
    Cancelled,
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Parameters for opening a group on an entry signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGroup {
    pub direction: Direction,
    pub product: ProductCode,
    pub target_price: Price,
    pub total_lots: u8,
}

impl NewGroup {
    /// Validate lot count and target price.
    pub fn validate(&self) -> crate::Result<()> {
        if self.total_lots == 0 || self.total_lots > MAX_LOTS_PER_GROUP {
            return Err(CoreError::InvalidLots(format!(
                "total_lots must be 1..={MAX_LOTS_PER_GROUP}, got {}",
                self.total_lots
            )));
        }
        if !self.target_price.is_positive() {
            return Err(CoreError::InvalidPrice(format!(
                "target_price must be positive, got {}",
                self.target_price
            )));
        }
        Ok(())
    }
}

/// A strategy group.
///
/// Invariant: `0 <= filled_lots <= submitted_lots <= total_lots`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyGroup {
    pub group_id: GroupId,
    pub direction: Direction,
    pub product: ProductCode,
    pub target_price: Price,
    pub total_lots: u8,
    pub submitted_lots: u8,
    pub filled_lots: u8,
    pub status: GroupStatus,
    /// Creation timestamp (Unix ms).
    pub created_at: u64,
}

impl StrategyGroup {
    pub fn new(group_id: GroupId, params: NewGroup, created_at: u64) -> Self {
        Self {
            group_id,
            direction: params.direction,
            product: params.product,
            target_price: params.target_price,
            total_lots: params.total_lots,
            submitted_lots: 0,
            filled_lots: 0,
            status: GroupStatus::Open,
            created_at,
        }
    }

    /// Lots submitted but neither filled nor released yet.
    pub fn outstanding_lots(&self) -> u8 {
        self.submitted_lots.saturating_sub(self.filled_lots)
    }

    /// Lots that may still be submitted.
    pub fn unsubmitted_lots(&self) -> u8 {
        self.total_lots.saturating_sub(self.submitted_lots)
    }

    /// Whether a fill can be applied to this group.
    pub fn has_fill_capacity(&self) -> bool {
        self.status == GroupStatus::Open && self.outstanding_lots() > 0
    }

    pub fn is_open(&self) -> bool {
        self.status == GroupStatus::Open
    }

    /// Check the lot-count invariant.
    pub fn invariant_holds(&self) -> bool {
        self.filled_lots <= self.submitted_lots && self.submitted_lots <= self.total_lots
    }
}
