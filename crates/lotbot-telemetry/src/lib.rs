//! Prometheus metrics and structured logging for lotbot.
//!
//! - Prometheus counters and gauges for report parsing, reconciliation,
//!   exits and the persistence queue
//! - Structured logging with tracing (JSON in production)

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{init_logging, parse_filter};
pub use metrics::Metrics;
