//! Multi-lot breakout bot.
//!
//! Main application that wires the components together:
//! - Broker report decoding
//! - FIFO reconciliation of reports onto strategy-group lots
//! - Per-lot exit risk (initial, trailing and protective stops)
//! - Virtual/real order routing
//! - Asynchronous state persistence and recovery

pub mod app;
pub mod config;
pub mod error;
pub mod replay;

pub use app::{Application, BotEvent, EntryReport, RecoveryReport, SweepReport};
pub use config::AppConfig;
pub use error::{AppError, AppResult};
