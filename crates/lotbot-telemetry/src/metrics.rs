//! Prometheus metrics for lotbot.
//!
//! Covers:
//! - Report parsing
//! - Reconciliation outcomes
//! - Order submission and the virtual/real mode gate
//! - Exit execution
//! - Persistence queue pressure
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! (e.g. a duplicate metric name) is a startup configuration error. These
//! panics only occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_counter, register_int_gauge,
    CounterVec, GaugeVec, IntCounter, IntGauge,
};

use crate::error::{TelemetryError, TelemetryResult};

/// Broker reports by parse result.
/// Labels: result (parsed/ignored/malformed)
pub static REPORTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lotbot_reports_total",
        "Broker execution reports by parse result",
        &["result"]
    )
    .unwrap()
});

/// Reconciled report units by outcome.
/// Labels: outcome (filled/released/duplicate/unmatched/after_complete/orphaned)
pub static FILLS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lotbot_fills_total",
        "Reconciled report units by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Entry orders by mode and result.
pub static ORDERS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lotbot_orders_total",
        "Entry order submissions",
        &["mode", "result"]
    )
    .unwrap()
});

/// Real orders that were never confirmed by a report.
pub static UNCONFIRMED_ORDERS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lotbot_unconfirmed_orders_total",
        "Real orders expired without a matching report"
    )
    .unwrap()
});

/// Current order mode (1 = active).
pub static ORDER_MODE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "lotbot_order_mode",
        "Current order mode (1=active, 0=inactive)",
        &["mode"]
    )
    .unwrap()
});

/// Exit attempts by result.
pub static EXITS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lotbot_exits_total",
        "Exit executor calls by result",
        &["result"]
    )
    .unwrap()
});

/// Positions under risk evaluation.
pub static ACTIVE_POSITIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "lotbot_active_positions",
        "Positions under risk evaluation"
    )
    .unwrap()
});

/// Persistence queue depth.
pub static PERSIST_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "lotbot_persist_queue_depth",
        "Mutations waiting in the persistence queue"
    )
    .unwrap()
});

/// Persistence tasks by result.
/// Labels: result (applied/failed/rejected/discarded)
pub static PERSIST_TASKS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lotbot_persist_tasks_total",
        "Persistence tasks by result",
        &["result"]
    )
    .unwrap()
});

/// Persistence tasks evicted under queue pressure.
pub static PERSIST_EVICTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lotbot_persist_evicted_total",
        "Persistence tasks evicted by priority",
        &["priority"]
    )
    .unwrap()
});

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    pub fn report_parsed(result: &str) {
        REPORTS_TOTAL.with_label_values(&[result]).inc();
    }

    /// Record one reconciled unit.
    pub fn fill_outcome(outcome: &str) {
        FILLS_TOTAL.with_label_values(&[outcome]).inc();
    }

    pub fn order_submitted(mode: &str, result: &str) {
        ORDERS_TOTAL.with_label_values(&[mode, result]).inc();
    }

    pub fn unconfirmed_order() {
        UNCONFIRMED_ORDERS_TOTAL.inc();
    }

    /// Set the active order mode. Only the active mode is 1.
    pub fn order_mode_set(mode: &str) {
        for m in &["virtual", "real"] {
            ORDER_MODE.with_label_values(&[m]).set(0.0);
        }
        ORDER_MODE.with_label_values(&[mode]).set(1.0);
    }

    pub fn exit_result(result: &str) {
        EXITS_TOTAL.with_label_values(&[result]).inc();
    }

    pub fn active_positions_set(count: usize) {
        ACTIVE_POSITIONS.set(count as i64);
    }

    pub fn persist_queue_depth(depth: usize) {
        PERSIST_QUEUE_DEPTH.set(depth as i64);
    }

    pub fn persist_task(result: &str) {
        PERSIST_TASKS_TOTAL.with_label_values(&[result]).inc();
    }

    /// Record tasks that completed with the same result.
    pub fn persist_tasks(result: &str, count: usize) {
        PERSIST_TASKS_TOTAL
            .with_label_values(&[result])
            .inc_by(count as f64);
    }

    pub fn persist_evicted(priority: &str) {
        PERSIST_EVICTED_TOTAL.with_label_values(&[priority]).inc();
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn gather_text() -> TelemetryResult<String> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&prometheus::gather(), &mut buffer)
            .map_err(|e| TelemetryError::MetricsEncode(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsEncode(e.to_string()))
    }
}
