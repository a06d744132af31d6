//! Circuit breaker outcomes shared by the risk manager and the event stream.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reason for circuit breaker activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripReason {
    /// API disconnected for longer than the grace period.
    ConnectivityLost,
    /// Account drawdown reached the configured maximum.
    MaxDrawdownBreached,
    /// Realized volatility at or above the extreme threshold.
    ExtremeVolatility,
    /// Position held for the maximum duration.
    MaxDurationExceeded,
    /// Price within the minimum buffer of the liquidation price.
    LiquidationProximity,
}

/// What a trip applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "position_ids", rename_all = "snake_case")]
pub enum TripScope {
    /// Every open position is closed.
    Account,
    /// Only the listed positions are closed.
    Positions(Vec<Uuid>),
    /// Existing positions keep running; new entries are refused.
    NewEntries,
}

/// Result of one circuit breaker evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum CircuitDecision {
    Continue,
    HaltNewEntries { volatility_pct: Decimal },
    ForceCloseAll { reason: TripReason, scope: TripScope },
}

impl CircuitDecision {
    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }

    /// Positions an emergency close must target, given the open set.
    pub fn close_targets(&self, open_positions: &[Uuid]) -> Vec<Uuid> {
        match self {
            Self::ForceCloseAll {
                scope: TripScope::Account,
                ..
            } => open_positions.to_vec(),
            Self::ForceCloseAll {
                scope: TripScope::Positions(ids),
                ..
            } => ids.clone(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_targets() {
        let open = vec![Uuid::new_v4(), Uuid::new_v4()];

        let all = CircuitDecision::ForceCloseAll {
            reason: TripReason::MaxDrawdownBreached,
            scope: TripScope::Account,
        };
        assert_eq!(all.close_targets(&open), open);

        let one = CircuitDecision::ForceCloseAll {
            reason: TripReason::LiquidationProximity,
            scope: TripScope::Positions(vec![open[1]]),
        };
        assert_eq!(one.close_targets(&open), vec![open[1]]);

        let halt = CircuitDecision::HaltNewEntries {
            volatility_pct: Decimal::new(12, 0),
        };
        assert!(halt.close_targets(&open).is_empty());
        assert!(CircuitDecision::Continue.is_continue());
    }
}
