//! Executor error types.

use lotbot_core::ProductCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Broker API not ready: {0}")]
    ApiNotReady(String),

    #[error("Order {order_no} for {product} was never confirmed")]
    UnconfirmedOrder {
        order_no: String,
        product: ProductCode,
    },

    #[error("Order submission failed: {0}")]
    SubmissionFailed(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Invalid order mode: {0}")]
    InvalidMode(String),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
