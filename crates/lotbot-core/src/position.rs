//! Lot records and their per-position risk state.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Direction, GroupId, PositionId, Price, ProductCode, SequenceId};

/// Lifecycle of a lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    /// Order submitted, no fill yet.
    Pending,
    /// Filled and under risk evaluation.
    Active,
    /// Closed by an exit.
    Exited,
    /// Entry order cancelled or rejected.
    Failed,
}

/// Broker-side order status of the lot's entry order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Rejected,
}

/// Why a lot left the Active/Pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    InitialStop,
    TrailingStop,
    ProtectiveStop,
    OrderCancelled,
    OrderRejected,
    GroupCancelled,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InitialStop => "INITIAL_STOP",
            Self::TrailingStop => "TRAILING_STOP",
            Self::ProtectiveStop => "PROTECTIVE_STOP",
            Self::OrderCancelled => "ORDER_CANCELLED",
            Self::OrderRejected => "ORDER_REJECTED",
            Self::GroupCancelled => "GROUP_CANCELLED",
            Self::Manual => "MANUAL",
        };
        f.write_str(s)
    }
}

/// One lot of a strategy group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub position_id: PositionId,
    pub group_id: GroupId,
    /// Lot number within the group (1-based).
    pub lot_id: u8,
    pub product: ProductCode,
    pub direction: Direction,
    /// Fill price, set when the lot is matched to a fill.
    pub entry_price: Option<Price>,
    pub status: PositionStatus,
    pub order_status: Option<OrderStatus>,
    pub retry_count: u8,
    pub max_slippage_points: Decimal,
    pub exit_reason: Option<ExitReason>,
    pub exit_price: Option<Price>,
    /// Broker report that filled or released the entry order.
    #[serde(default)]
    pub report_sequence_id: Option<SequenceId>,
    /// Submission timestamp (Unix ms).
    pub submitted_at: u64,
    /// Last state change (Unix ms).
    pub updated_at: u64,
}

impl PositionRecord {
    /// A freshly submitted, not yet filled lot.
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        position_id: PositionId,
        group_id: GroupId,
        lot_id: u8,
        product: ProductCode,
        direction: Direction,
        retry_count: u8,
        max_slippage_points: Decimal,
        submitted_at: u64,
    ) -> Self {
        Self {
            position_id,
            group_id,
            lot_id,
            product,
            direction,
            entry_price: None,
            status: PositionStatus::Pending,
            order_status: Some(OrderStatus::Pending),
            retry_count,
            max_slippage_points,
            exit_reason: None,
            exit_price: None,
            report_sequence_id: None,
            submitted_at,
            updated_at: submitted_at,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == PositionStatus::Active
    }

    pub fn is_pending(&self) -> bool {
        self.status == PositionStatus::Pending
    }

    /// Mark the lot filled at `price`.
    pub fn activate(&mut self, price: Price, now_ms: u64) {
        self.entry_price = Some(price);
        self.status = PositionStatus::Active;
        self.order_status = Some(OrderStatus::Filled);
        self.updated_at = now_ms;
    }

    /// Mark the entry order released (cancelled or rejected).
    pub fn fail(&mut self, order_status: OrderStatus, reason: ExitReason, now_ms: u64) {
        self.status = PositionStatus::Failed;
        self.order_status = Some(order_status);
        self.exit_reason = Some(reason);
        self.updated_at = now_ms;
    }

    /// Mark the lot closed.
    pub fn exit(&mut self, price: Price, reason: ExitReason, now_ms: u64) {
        self.status = PositionStatus::Exited;
        self.exit_price = Some(price);
        self.exit_reason = Some(reason);
        self.updated_at = now_ms;
    }
}

/// Reason attached to the latest risk-state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateReason {
    PriceUpdate,
    TrailingActivation,
    ProtectiveUpdate,
    Initialization,
    FillConfirmedInit,
}

impl fmt::Display for UpdateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PriceUpdate => "PRICE_UPDATE",
            Self::TrailingActivation => "TRAILING_ACTIVATION",
            Self::ProtectiveUpdate => "PROTECTIVE_UPDATE",
            Self::Initialization => "INITIALIZATION",
            Self::FillConfirmedInit => "FILL_CONFIRMED_INIT",
        };
        f.write_str(s)
    }
}

/// Live exit-risk cache of an Active position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskState {
    pub peak_price: Price,
    pub current_stop_loss: Price,
    pub trailing_activated: bool,
    pub protection_activated: bool,
    /// Unix ms of the last change.
    pub last_update_time: u64,
    pub update_reason: UpdateReason,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record() -> PositionRecord {
        PositionRecord::pending(
            PositionId(1),
            GroupId(1),
            1,
            ProductCode::new("MTX00"),
            Direction::Long,
            0,
            dec!(5),
            100,
        )
    }

    #[test]
    fn test_lifecycle() {
        let mut p = record();
        assert!(p.is_pending());
        assert_eq!(p.order_status, Some(OrderStatus::Pending));

        p.activate(Price::new(dec!(22500)), 200);
        assert!(p.is_active());
        assert_eq!(p.entry_price, Some(Price::new(dec!(22500))));
        assert_eq!(p.order_status, Some(OrderStatus::Filled));

        p.exit(Price::new(dec!(22516)), ExitReason::TrailingStop, 300);
        assert_eq!(p.status, PositionStatus::Exited);
        assert_eq!(p.exit_reason, Some(ExitReason::TrailingStop));
        assert_eq!(p.updated_at, 300);
    }

    #[test]
    fn test_fail() {
        let mut p = record();
        p.fail(OrderStatus::Rejected, ExitReason::OrderRejected, 150);
        assert_eq!(p.status, PositionStatus::Failed);
        assert_eq!(p.order_status, Some(OrderStatus::Rejected));
        assert!(p.entry_price.is_none());
    }

    #[test]
    fn test_journal_without_report_sequence_id() {
        let mut value = serde_json::to_value(record()).unwrap();
        value.as_object_mut().unwrap().remove("report_sequence_id");
        let p: PositionRecord = serde_json::from_value(value).unwrap();
        assert_eq!(p.report_sequence_id, None);
    }

    #[test]
    fn test_display() {
        assert_eq!(ExitReason::ProtectiveStop.to_string(), "PROTECTIVE_STOP");
        assert_eq!(UpdateReason::FillConfirmedInit.to_string(), "FILL_CONFIRMED_INIT");
    }
}
