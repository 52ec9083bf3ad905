//! Broker execution report decoding for lotbot.
//!
//! Turns the broker's comma-delimited, fixed-layout reply records into
//! typed [`FillEvent`](lotbot_core::FillEvent)s for the reconciliation engine.

pub mod error;
pub mod parser;

pub use error::{FeedError, FeedResult};
pub use parser::{FillReportParser, ParseStats, ReportLayout};
