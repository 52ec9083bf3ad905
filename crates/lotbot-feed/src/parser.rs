//! Execution report parsing.
//!
//! The broker delivers order replies as comma-delimited records with a fixed
//! field layout. Only a handful of fields are consumed: sequence number,
//! report type code, error flag, buy/sell, product, price and quantity.
//! Everything else in the record is ignored.
//!
//! Report type codes (defaults):
//! - `D` (deal): FILLED
//! - `C`: CANCELLED
//! - any code with error flag `Y`: REJECTED
//! - `N` without error: order acknowledgement, not a fill (ignored)

use std::sync::atomic::{AtomicU64, Ordering};

use lotbot_core::{Direction, FillEvent, Price, ProductCode, ReportType, SequenceId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{FeedError, FeedResult};

/// Field positions and codes of the broker reply record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportLayout {
    pub sequence_idx: usize,
    pub type_idx: usize,
    pub error_idx: usize,
    /// Buy/sell field. `None` when the record carries no side.
    pub side_idx: Option<usize>,
    pub product_idx: usize,
    pub order_no_idx: Option<usize>,
    pub price_idx: usize,
    pub quantity_idx: usize,
    /// Implied decimal places of integer prices.
    pub price_scale: u32,
    pub filled_code: String,
    pub cancelled_code: String,
    pub ack_code: String,
    pub error_flag: String,
}

impl Default for ReportLayout {
    fn default() -> Self {
        Self {
            sequence_idx: 0,
            type_idx: 2,
            error_idx: 3,
            side_idx: Some(6),
            product_idx: 8,
            order_no_idx: Some(10),
            price_idx: 11,
            quantity_idx: 20,
            price_scale: 0,
            filled_code: "D".to_string(),
            cancelled_code: "C".to_string(),
            ack_code: "N".to_string(),
            error_flag: "Y".to_string(),
        }
    }
}

/// Parse counters.
#[derive(Debug, Default)]
pub struct ParseStats {
    parsed: AtomicU64,
    ignored: AtomicU64,
    malformed: AtomicU64,
}

impl ParseStats {
    pub fn parsed(&self) -> u64 {
        self.parsed.load(Ordering::Relaxed)
    }

    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// Decoder for broker reply records.
#[derive(Debug, Default)]
pub struct FillReportParser {
    layout: ReportLayout,
    stats: ParseStats,
}

impl FillReportParser {
    pub fn new(layout: ReportLayout) -> Self {
        Self {
            layout,
            stats: ParseStats::default(),
        }
    }

    pub fn layout(&self) -> &ReportLayout {
        &self.layout
    }

    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }

    /// Decode one raw record.
    ///
    /// Returns `Ok(None)` for records that are well-formed but are not
    /// fill/cancel/reject reports (acknowledgements, unknown codes).
    pub fn parse(&self, raw: &str) -> FeedResult<Option<FillEvent>> {
        let result = self.decode(raw);
        match &result {
            Ok(Some(_)) => self.stats.parsed.fetch_add(1, Ordering::Relaxed),
            Ok(None) => self.stats.ignored.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.malformed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    fn decode(&self, raw: &str) -> FeedResult<Option<FillEvent>> {
        let fields: Vec<&str> = raw.trim_end_matches(&['\r', '\n'][..]).split(',').collect();
        let layout = &self.layout;

        let sequence = required(&fields, layout.sequence_idx, "sequence_id")?;
        let type_code = required(&fields, layout.type_idx, "report_type")?;
        let has_error = optional(&fields, layout.error_idx)
            .is_some_and(|flag| flag.eq_ignore_ascii_case(&layout.error_flag));

        let report_type = if has_error {
            ReportType::Rejected
        } else if type_code.eq_ignore_ascii_case(&layout.filled_code) {
            ReportType::Filled
        } else if type_code.eq_ignore_ascii_case(&layout.cancelled_code) {
            ReportType::Cancelled
        } else {
            trace!(
                sequence_id = %sequence,
                type_code = %type_code,
                is_ack = type_code.eq_ignore_ascii_case(&layout.ack_code),
                "Ignoring non-fill report"
            );
            return Ok(None);
        };

        let product = required(&fields, layout.product_idx, "product")?;
        let price = self.parse_price(required(&fields, layout.price_idx, "price")?)?;
        if report_type == ReportType::Filled && !price.is_positive() {
            return Err(FeedError::malformed(
                "price",
                format!("fill price must be positive, got {price}"),
            ));
        }

        let quantity_raw = required(&fields, layout.quantity_idx, "quantity")?;
        let quantity: u32 = quantity_raw
            .parse()
            .map_err(|_| FeedError::malformed("quantity", format!("not an integer: {quantity_raw}")))?;
        if quantity == 0 {
            return Err(FeedError::malformed("quantity", "quantity must be >= 1"));
        }

        let direction = layout
            .side_idx
            .and_then(|idx| optional(&fields, idx))
            .and_then(parse_side);
        let order_no = layout
            .order_no_idx
            .and_then(|idx| optional(&fields, idx))
            .map(str::to_string);

        Ok(Some(FillEvent {
            report_type,
            product: ProductCode::new(product),
            price,
            quantity,
            sequence_id: SequenceId::new(sequence),
            direction,
            order_no,
        }))
    }

    /// Integer prices are in broker-native scale; fixed-point prices are taken as-is.
    fn parse_price(&self, raw: &str) -> FeedResult<Price> {
        if raw.contains('.') {
            return raw
                .parse::<Decimal>()
                .map(Price::new)
                .map_err(|e| FeedError::malformed("price", format!("{raw}: {e}")));
        }
        let value = raw
            .parse::<i64>()
            .map_err(|_| FeedError::malformed("price", format!("not numeric: {raw}")))?;
        Price::from_scaled(value, self.layout.price_scale).map_err(|e| {
            FeedError::malformed(
                "price",
                format!("{raw} at scale {}: {e}", self.layout.price_scale),
            )
        })
    }
}

fn optional<'a>(fields: &[&'a str], idx: usize) -> Option<&'a str> {
    fields.get(idx).copied().map(str::trim).filter(|f| !f.is_empty())
}

fn required<'a>(fields: &[&'a str], idx: usize, name: &'static str) -> FeedResult<&'a str> {
    optional(fields, idx)
        .ok_or_else(|| FeedError::malformed(name, format!("missing at index {idx}")))
}

/// Buy/sell codes are matched on their first character (`B`, `S`).
fn parse_side(raw: &str) -> Option<Direction> {
    match raw.chars().next()?.to_ascii_uppercase() {
        'B' => Some(Direction::Long),
        'S' => Some(Direction::Short),
        _ => None,
    }
}
