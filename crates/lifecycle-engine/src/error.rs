//! Errors surfaced by the lifecycle orchestrator.

use rust_decimal::Decimal;
use risk_manager::SizingError;
use thiserror::Error;
use uuid::Uuid;

use crate::orchestrator::TradingMode;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Sizing rejected: {0}")]
    Sizing(#[from] SizingError),

    #[error("New entries are not accepted in {mode:?} mode")]
    EntriesHalted { mode: TradingMode },

    #[error("Margin {required} exceeds remaining headroom {headroom}")]
    MarginLimitExceeded { required: Decimal, headroom: Decimal },

    #[error("A critical delivery failed; acknowledge the operator alert first")]
    OperatorAttentionRequired,

    #[error("Position not found: {0}")]
    PositionNotFound(Uuid),

    #[error("Invalid fill: {message}")]
    InvalidFill { message: String },

    #[error(transparent)]
    Core(#[from] perp_core::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
