//! Feed error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    /// A required field is missing or not decodable. The report is dropped.
    #[error("Malformed report: field '{field}': {reason}")]
    MalformedReport { field: &'static str, reason: String },
}

impl FeedError {
    pub(crate) fn malformed(field: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedReport {
            field,
            reason: reason.into(),
        }
    }
}

pub type FeedResult<T> = Result<T, FeedError>;
