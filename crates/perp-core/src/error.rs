//! Error types for the perp-guard engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::CorrelationId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid health snapshot: {message}")]
    InvalidSnapshot { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Terminal delivery failures surfaced by the execution queue.
///
/// Both variants always carry the correlation id so a failure can be traced
/// back to the position it was protecting.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryError {
    /// Venue rejected the order permanently; it was never retried.
    #[error("Order {correlation_id} rejected: {reason}")]
    OrderRejected {
        correlation_id: CorrelationId,
        reason: String,
        critical: bool,
    },

    /// Retries were exhausted (including the market-order last resort for
    /// critical intents).
    #[error("Delivery of {correlation_id} abandoned after {attempts} attempts: {last_failure}")]
    DeliveryAbandoned {
        correlation_id: CorrelationId,
        attempts: u32,
        last_failure: String,
        critical: bool,
    },
}

impl DeliveryError {
    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            Self::OrderRejected { correlation_id, .. } => correlation_id,
            Self::DeliveryAbandoned { correlation_id, .. } => correlation_id,
        }
    }

    pub fn is_critical(&self) -> bool {
        match self {
            Self::OrderRejected { critical, .. } => *critical,
            Self::DeliveryAbandoned { critical, .. } => *critical,
        }
    }
}
