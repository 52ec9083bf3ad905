//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Feed error: {0}")]
    Feed(#[from] lotbot_feed::FeedError),

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] lotbot_position::ReconcileError),

    #[error("Position error: {0}")]
    Position(#[from] lotbot_position::PositionError),

    #[error("Executor error: {0}")]
    Executor(#[from] lotbot_executor::ExecutorError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] lotbot_telemetry::TelemetryError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] lotbot_persistence::PersistenceError),

    #[error("Replay error at line {line}: {message}")]
    Replay { line: usize, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
