//! Error types for domain value parsing
//!
//! Raised when upstream or downstream data does not fit the event model.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("Invalid transaction hash: {0:?}")]
    InvalidTxHash(String),

    #[error("Unknown event type: {0:?}")]
    UnknownEventType(String),

    #[error("Delivery status must not be empty")]
    EmptyDeliveryStatus,
}
