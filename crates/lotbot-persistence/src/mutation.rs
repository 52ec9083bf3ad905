//! State mutations scheduled for persistence.
//!
//! Every payload is a full snapshot of its entity, so a later mutation for
//! the same key supersedes an earlier one. Dropping a low-priority snapshot
//! under pressure loses intermediate history only.

use std::fmt;

use serde::{Deserialize, Serialize};

use lotbot_core::{now_ms, PositionId, PositionRecord, RiskState, StrategyGroup, UpdateReason};

/// Scheduling priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a mutation was scheduled. Determines its priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationReason {
    FillConfirmed,
    Exit,
    GroupUpdate,
    OrderFailed,
    StopLossUpdate,
    TrailingActivated,
    ProtectionActivated,
    PeakUpdate,
}

impl MutationReason {
    #[must_use]
    pub fn priority(&self) -> Priority {
        match self {
            Self::FillConfirmed | Self::Exit | Self::GroupUpdate | Self::OrderFailed => {
                Priority::High
            }
            Self::StopLossUpdate | Self::TrailingActivated | Self::ProtectionActivated => {
                Priority::Normal
            }
            Self::PeakUpdate => Priority::Low,
        }
    }

    /// Map a risk-state change to its persistence reason.
    #[must_use]
    pub fn from_update(reason: UpdateReason) -> Self {
        match reason {
            UpdateReason::PriceUpdate => Self::PeakUpdate,
            UpdateReason::TrailingActivation => Self::TrailingActivated,
            UpdateReason::ProtectiveUpdate => Self::ProtectionActivated,
            UpdateReason::Initialization | UpdateReason::FillConfirmedInit => Self::FillConfirmed,
        }
    }
}

/// Kind of persisted entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Group,
    Position,
    Risk,
}

/// Entity snapshot carried by a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Payload {
    Group(StrategyGroup),
    Position(PositionRecord),
    /// `state: None` clears the cached risk state (position exited).
    Risk {
        position_id: PositionId,
        state: Option<RiskState>,
    },
}

/// A keyed, full-state upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub entity: EntityKind,
    pub key: String,
    pub payload: Payload,
    pub reason: MutationReason,
    /// Unix ms.
    pub scheduled_at: u64,
}

impl Mutation {
    pub fn group(group: &StrategyGroup, reason: MutationReason) -> Self {
        Self {
            entity: EntityKind::Group,
            key: group.group_id.to_string(),
            payload: Payload::Group(group.clone()),
            reason,
            scheduled_at: now_ms(),
        }
    }

    pub fn position(position: &PositionRecord, reason: MutationReason) -> Self {
        Self {
            entity: EntityKind::Position,
            key: position.position_id.to_string(),
            payload: Payload::Position(position.clone()),
            reason,
            scheduled_at: now_ms(),
        }
    }

    pub fn risk(position_id: PositionId, state: Option<RiskState>, reason: MutationReason) -> Self {
        Self {
            entity: EntityKind::Risk,
            key: format!("R{}", position_id.0),
            payload: Payload::Risk { position_id, state },
            reason,
            scheduled_at: now_ms(),
        }
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.reason.priority()
    }
}
