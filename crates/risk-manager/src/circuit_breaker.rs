//! Circuit breaker for emergency exits and entry halts.
//!
//! Evaluation is stateless: every tick is judged on its own snapshot. Rules are
//! checked in a fixed order and the first match wins, so account-wide force
//! closes always dominate the softer entry halt.

use chrono::{DateTime, Duration, Utc};
use perp_core::types::{
    AccountState, CircuitDecision, HealthSnapshot, Position, TripReason, TripScope,
};
use perp_core::EngineSettings;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Configuration for circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Seconds the venue may be unreachable before everything is closed.
    pub connectivity_grace_secs: u64,
    /// Maximum drawdown (percentage, e.g. 50 = 50%).
    pub max_drawdown_pct: Decimal,
    /// Intraday range at which new entries halt (percentage).
    pub extreme_volatility_pct: Decimal,
    /// Maximum time a single position may stay open.
    pub max_hold_seconds: u64,
    /// Minimum distance to liquidation (percentage of price).
    pub liquidation_buffer_pct: Decimal,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            connectivity_grace_secs: 10,
            max_drawdown_pct: Decimal::new(50, 0),       // 50%
            extreme_volatility_pct: Decimal::new(10, 0), // 10% intraday range
            max_hold_seconds: 86_400,                    // 24h
            liquidation_buffer_pct: Decimal::new(5, 0),  // 5%
        }
    }
}

impl From<&EngineSettings> for CircuitBreakerConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            connectivity_grace_secs: settings.connectivity_grace_secs,
            max_drawdown_pct: settings.max_drawdown_pct,
            extreme_volatility_pct: settings.extreme_volatility_pct,
            max_hold_seconds: settings.max_hold_seconds,
            liquidation_buffer_pct: settings.liquidation_buffer_pct,
        }
    }
}

/// Stateless circuit breaker.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Evaluate the full trigger table for one tick.
    pub fn evaluate<'a, I>(
        &self,
        snapshot: &HealthSnapshot,
        account: &AccountState,
        positions: I,
        now: DateTime<Utc>,
    ) -> CircuitDecision
    where
        I: IntoIterator<Item = &'a Position>,
    {
        if !snapshot.api_connected
            && snapshot.seconds_since_heartbeat > self.config.connectivity_grace_secs
        {
            error!(
                seconds_since_heartbeat = snapshot.seconds_since_heartbeat,
                grace_secs = self.config.connectivity_grace_secs,
                "Venue connectivity lost"
            );
            return force_close_account(TripReason::ConnectivityLost);
        }

        let drawdown = effective_drawdown(snapshot, account);
        if drawdown >= self.config.max_drawdown_pct {
            error!(
                drawdown_pct = %drawdown,
                max_drawdown_pct = %self.config.max_drawdown_pct,
                equity = %account.equity,
                "Maximum drawdown breached"
            );
            return force_close_account(TripReason::MaxDrawdownBreached);
        }

        if snapshot.volatility >= self.config.extreme_volatility_pct {
            warn!(
                volatility_pct = %snapshot.volatility,
                threshold_pct = %self.config.extreme_volatility_pct,
                "Extreme volatility, halting new entries"
            );
            return CircuitDecision::HaltNewEntries {
                volatility_pct: snapshot.volatility,
            };
        }

        self.evaluate_position_rules(snapshot, positions, now)
    }

    /// Evaluate only the per-position rules (hold duration, liquidation
    /// proximity).
    pub fn evaluate_position_rules<'a, I>(
        &self,
        snapshot: &HealthSnapshot,
        positions: I,
        now: DateTime<Utc>,
    ) -> CircuitDecision
    where
        I: IntoIterator<Item = &'a Position>,
    {
        let open: Vec<&Position> = positions.into_iter().filter(|p| !p.is_closed()).collect();
        // A hold limit beyond chrono's range can never be reached.
        let max_hold = i64::try_from(self.config.max_hold_seconds)
            .ok()
            .and_then(Duration::try_seconds);

        let aged: Vec<Uuid> = match max_hold {
            Some(max_hold) => open
                .iter()
                .filter(|p| p.age(now) >= max_hold)
                .map(|p| p.id)
                .collect(),
            None => Vec::new(),
        };
        if !aged.is_empty() {
            warn!(
                positions = ?aged,
                max_hold_seconds = self.config.max_hold_seconds,
                "Maximum hold duration exceeded"
            );
            return CircuitDecision::ForceCloseAll {
                reason: TripReason::MaxDurationExceeded,
                scope: TripScope::Positions(aged),
            };
        }

        let near_liquidation: Vec<Uuid> = open
            .iter()
            .filter(|p| {
                p.liquidation_distance_pct(snapshot.price) <= self.config.liquidation_buffer_pct
            })
            .map(|p| p.id)
            .collect();
        if !near_liquidation.is_empty() {
            error!(
                positions = ?near_liquidation,
                price = %snapshot.price,
                buffer_pct = %self.config.liquidation_buffer_pct,
                "Price within liquidation buffer"
            );
            return CircuitDecision::ForceCloseAll {
                reason: TripReason::LiquidationProximity,
                scope: TripScope::Positions(near_liquidation),
            };
        }

        debug!(open_positions = open.len(), "Circuit breaker clear");
        CircuitDecision::Continue
    }
}

/// Snapshot drawdown, or a total loss when equity is exhausted.
fn effective_drawdown(snapshot: &HealthSnapshot, account: &AccountState) -> Decimal {
    if account.equity <= Decimal::ZERO {
        Decimal::ONE_HUNDRED
    } else {
        snapshot.drawdown_pct
    }
}

fn force_close_account(reason: TripReason) -> CircuitDecision {
    CircuitDecision::ForceCloseAll {
        reason,
        scope: TripScope::Account,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perp_core::types::PositionSide;

    const NONE: &[Position] = &[];

    fn account() -> AccountState {
        AccountState::new(Decimal::new(10000, 0))
    }

    fn long_position() -> Position {
        Position::new(
            "BTCUSDT".to_string(),
            PositionSide::Long,
            Decimal::new(95000, 0),
            Decimal::new(5, 1),
            Decimal::new(10, 0),
            Decimal::new(4750, 0),
            Decimal::new(94000, 0),
            None,
            Decimal::new(87400, 0),
        )
    }

    fn short_position() -> Position {
        Position::new(
            "BTCUSDT".to_string(),
            PositionSide::Short,
            Decimal::new(95000, 0),
            Decimal::new(5, 1),
            Decimal::new(10, 0),
            Decimal::new(4750, 0),
            Decimal::new(96000, 0),
            None,
            Decimal::new(102600, 0),
        )
    }

    fn healthy() -> HealthSnapshot {
        HealthSnapshot::healthy(Decimal::new(95000, 0))
    }

    #[test]
    fn test_healthy_continues() {
        let breaker = CircuitBreaker::default();
        let positions = vec![long_position(), short_position()];
        let decision = breaker.evaluate(&healthy(), &account(), &positions, Utc::now());
        assert!(decision.is_continue());
    }

    #[test]
    fn test_drawdown_closes_account() {
        let breaker = CircuitBreaker::default();
        let snapshot = healthy().with_drawdown(Decimal::new(55, 0));

        let decision = breaker.evaluate(&snapshot, &account(), NONE, Utc::now());
        assert_eq!(
            decision,
            CircuitDecision::ForceCloseAll {
                reason: TripReason::MaxDrawdownBreached,
                scope: TripScope::Account,
            }
        );

        let at_limit = healthy().with_drawdown(Decimal::new(50, 0));
        assert!(!breaker.evaluate(&at_limit, &account(), NONE, Utc::now()).is_continue());
    }

    #[test]
    fn test_exhausted_equity_counts_as_drawdown() {
        let breaker = CircuitBreaker::default();
        let broke = AccountState::new(Decimal::ZERO);
        let decision = breaker.evaluate(&healthy(), &broke, NONE, Utc::now());
        assert!(matches!(
            decision,
            CircuitDecision::ForceCloseAll {
                reason: TripReason::MaxDrawdownBreached,
                ..
            }
        ));
    }

    #[test]
    fn test_drawdown_dominates_volatility() {
        let breaker = CircuitBreaker::default();
        let snapshot = healthy()
            .with_drawdown(Decimal::new(60, 0))
            .with_volatility(Decimal::new(15, 0));

        let decision = breaker.evaluate(&snapshot, &account(), NONE, Utc::now());
        assert!(matches!(
            decision,
            CircuitDecision::ForceCloseAll {
                reason: TripReason::MaxDrawdownBreached,
                ..
            }
        ));
    }

    #[test]
    fn test_connectivity_grace_period() {
        let breaker = CircuitBreaker::default();

        let within_grace = healthy().disconnected(10);
        assert!(breaker
            .evaluate(&within_grace, &account(), NONE, Utc::now())
            .is_continue());

        let lost = healthy().disconnected(11).with_drawdown(Decimal::new(70, 0));
        assert_eq!(
            breaker.evaluate(&lost, &account(), NONE, Utc::now()),
            CircuitDecision::ForceCloseAll {
                reason: TripReason::ConnectivityLost,
                scope: TripScope::Account,
            }
        );
    }

    #[test]
    fn test_extreme_volatility_halts_entries() {
        let breaker = CircuitBreaker::default();
        let snapshot = healthy().with_volatility(Decimal::new(12, 0));

        let decision = breaker.evaluate(&snapshot, &account(), &[long_position()], Utc::now());
        assert_eq!(
            decision,
            CircuitDecision::HaltNewEntries {
                volatility_pct: Decimal::new(12, 0)
            }
        );
    }

    #[test]
    fn test_max_duration_targets_only_aged_position() {
        let breaker = CircuitBreaker::default();
        let now = Utc::now();
        let old = long_position().with_opened_at(now - Duration::hours(25));
        let fresh = long_position();

        let decision = breaker.evaluate(&healthy(), &account(), [&old, &fresh], now);
        assert_eq!(
            decision,
            CircuitDecision::ForceCloseAll {
                reason: TripReason::MaxDurationExceeded,
                scope: TripScope::Positions(vec![old.id]),
            }
        );
    }

    #[test]
    fn test_out_of_range_hold_limit_never_ages() {
        let now = Utc::now();
        let old = long_position().with_opened_at(now - Duration::days(3650));
        for max_hold_seconds in [10_000_000_000_000_000, u64::MAX] {
            let breaker = CircuitBreaker::new(CircuitBreakerConfig {
                max_hold_seconds,
                ..Default::default()
            });
            assert_eq!(
                breaker.evaluate(&healthy(), &account(), [&old], now),
                CircuitDecision::Continue
            );
        }
    }

    #[test]
    fn test_liquidation_proximity_is_side_aware() {
        let breaker = CircuitBreaker::default();
        let long = long_position();
        let short = short_position();
        let positions = vec![long.clone(), short.clone()];

        // 4% above the long's liquidation, far from the short's.
        let falling = HealthSnapshot::healthy(Decimal::new(91000, 0));
        let decision = breaker.evaluate(&falling, &account(), &positions, Utc::now());
        assert_eq!(
            decision,
            CircuitDecision::ForceCloseAll {
                reason: TripReason::LiquidationProximity,
                scope: TripScope::Positions(vec![long.id]),
            }
        );

        let rising = HealthSnapshot::healthy(Decimal::new(99000, 0));
        let decision = breaker.evaluate(&rising, &account(), &positions, Utc::now());
        assert_eq!(
            decision,
            CircuitDecision::ForceCloseAll {
                reason: TripReason::LiquidationProximity,
                scope: TripScope::Positions(vec![short.id]),
            }
        );
    }

    #[test]
    fn test_position_rules_skip_closed() {
        let breaker = CircuitBreaker::default();
        let now = Utc::now();
        let mut old = long_position().with_opened_at(now - Duration::hours(30));
        old.reduce(old.quantity);

        let decision = breaker.evaluate_position_rules(&healthy(), [&old], now);
        assert!(decision.is_continue());
    }

    #[test]
    fn test_from_settings() {
        let settings = EngineSettings {
            max_drawdown_pct: Decimal::new(30, 0),
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::from(&settings));
        let snapshot = healthy().with_drawdown(Decimal::new(35, 0));
        assert!(!breaker.evaluate(&snapshot, &account(), NONE, Utc::now()).is_continue());
    }
}
