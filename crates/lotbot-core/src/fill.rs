//! Decoded broker execution reports.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Direction, Price, ProductCode};

/// Broker report sequence identifier, used for replay de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(String);

impl SequenceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of execution report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReportType {
    Filled,
    Cancelled,
    Rejected,
}

impl ReportType {
    /// Cancelled and rejected reports both release a submitted lot.
    pub fn is_release(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Rejected)
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// A fill, cancel, or reject report.
///
/// Carries no internal group or lot identifier: mapping a report onto a lot
/// is the reconciliation engine's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillEvent {
    pub report_type: ReportType,
    pub product: ProductCode,
    pub price: Price,
    /// Number of contracts (lots) in this report. Always >= 1.
    pub quantity: u32,
    pub sequence_id: SequenceId,
    /// Position direction implied by the report's buy/sell field, if present.
    pub direction: Option<Direction>,
    /// Broker order number, informational only.
    #[serde(default)]
    pub order_no: Option<String>,
}

impl FillEvent {
    /// Build a filled report (used for simulated fills and tests).
    pub fn filled(
        product: ProductCode,
        price: Price,
        quantity: u32,
        sequence_id: SequenceId,
        direction: Option<Direction>,
    ) -> Self {
        Self {
            report_type: ReportType::Filled,
            product,
            price,
            quantity,
            sequence_id,
            direction,
            order_no: None,
        }
    }
}
