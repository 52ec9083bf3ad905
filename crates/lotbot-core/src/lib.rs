//! Core domain types for the lotbot futures trading core.
//!
//! This crate provides the shared data model used by every other crate:
//! - `Price`: Precision-safe price type
//! - `Direction`, `ProductCode`: Trading enums and identifiers
//! - `StrategyGroup`: A multi-lot entry opened on one breakout signal
//! - `PositionRecord`, `RiskState`: One resolved lot and its exit-risk cache
//! - `FillEvent`: A decoded broker execution report

pub mod decimal;
pub mod error;
pub mod fill;
pub mod group;
pub mod position;
pub mod types;

pub use decimal::{Price, MAX_PRICE_SCALE};
pub use error::{CoreError, Result};
pub use fill::{FillEvent, ReportType, SequenceId};
pub use group::{GroupStatus, NewGroup, StrategyGroup};
pub use position::{
    ExitReason, OrderStatus, PositionRecord, PositionStatus, RiskState, UpdateReason,
};
pub use types::{
    now_ms, Direction, GroupId, PositionId, ProductCode, MAX_LOTS_PER_GROUP, MAX_RETRY_COUNT,
};
