//! Telemetry error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Logging initialization failed: {0}")]
    LoggingInit(String),

    /// `RUST_LOG` (or an explicit filter) did not parse.
    #[error("Invalid log filter {filter:?}: {reason}")]
    InvalidLogFilter { filter: String, reason: String },

    #[error("Metrics encoding failed: {0}")]
    MetricsEncode(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
