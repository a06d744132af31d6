//! Risk Manager
//!
//! Position sizing, tiered trailing stops, circuit breakers and fee
//! accounting for leveraged perpetual positions. Everything here is pure and
//! synchronous; callers own the account and position state.

pub mod circuit_breaker;
pub mod fees;
pub mod sizing;
pub mod trailing_stop;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use fees::{FeeConfig, FeeModel, Liquidity, PnlBreakdown, SlippageCheck};
pub use sizing::{
    take_profit_levels, PositionSizing, RiskSizer, SizingConfig, SizingError, SizingRequest,
    TakeProfitLevel, DEFAULT_TAKE_PROFIT_RATIOS,
};
pub use trailing_stop::{StopAdvance, TrailingStopConfig, TrailingStopController};
