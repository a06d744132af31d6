//! Tiered trailing stop controller.
//!
//! Positions move forward through `Initial -> Breakeven -> ActiveTrail ->
//! TightTrail` as their reward-to-risk ratio grows. The protective stop only
//! ever tightens; the controller keeps no state of its own and works on the
//! position it is handed.

use perp_core::types::{HealthSnapshot, OrderIntent, Position, PositionSide, ProtectionTier};
use perp_core::EngineSettings;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Configuration for the trailing stop tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStopConfig {
    /// R at which the stop locks to entry.
    pub breakeven_r: Decimal,
    /// R at which the stop starts trailing with `k1`.
    pub active_trail_r: Decimal,
    /// R at which the trail tightens to `k2`.
    pub tight_trail_r: Decimal,
    /// ATR multiplier while in `ActiveTrail`.
    pub k1: Decimal,
    /// ATR multiplier while in `TightTrail`.
    pub k2: Decimal,
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            breakeven_r: Decimal::ONE,
            active_trail_r: Decimal::new(3, 0),
            tight_trail_r: Decimal::new(10, 0),
            k1: Decimal::new(15, 1), // 1.5x ATR
            k2: Decimal::new(5, 1),  // 0.5x ATR
        }
    }
}

impl From<&EngineSettings> for TrailingStopConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            breakeven_r: settings.breakeven_r,
            active_trail_r: settings.active_trail_r,
            tight_trail_r: settings.tight_trail_r,
            k1: settings.trail_k1,
            k2: settings.trail_k2,
        }
    }
}

/// Outcome of advancing one position by one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum StopAdvance {
    /// Stop price unchanged. The tier may still have advanced.
    Held { tier: ProtectionTier },
    /// Stop tightened; `intent` replaces the resting stop at the venue.
    Moved {
        tier: ProtectionTier,
        old_stop: Decimal,
        new_stop: Decimal,
        intent: OrderIntent,
    },
    /// Volatility input unusable; stop and tier held.
    Skipped,
    /// Position is closed, nothing to protect.
    Closed,
}

impl StopAdvance {
    pub fn intent(&self) -> Option<&OrderIntent> {
        match self {
            Self::Moved { intent, .. } => Some(intent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrailingStopController {
    config: TrailingStopConfig,
}

impl TrailingStopController {
    pub fn new(config: TrailingStopConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrailingStopConfig {
        &self.config
    }

    /// Highest tier whose R threshold is met.
    pub fn tier_for(&self, r: Decimal) -> ProtectionTier {
        if r >= self.config.tight_trail_r {
            ProtectionTier::TightTrail
        } else if r >= self.config.active_trail_r {
            ProtectionTier::ActiveTrail
        } else if r >= self.config.breakeven_r {
            ProtectionTier::Breakeven
        } else {
            ProtectionTier::Initial
        }
    }

    /// Advance `position` against the tick's price and volatility.
    pub fn advance(&self, position: &mut Position, snapshot: &HealthSnapshot) -> StopAdvance {
        if position.is_closed() {
            return StopAdvance::Closed;
        }

        let price = snapshot.price;
        let r = position.reward_to_risk(price);
        let target = position.tier.max(self.tier_for(r));

        let (tier, candidate) = match target {
            ProtectionTier::Initial => (target, None),
            ProtectionTier::Breakeven => (target, Some(position.entry_price)),
            ProtectionTier::ActiveTrail | ProtectionTier::TightTrail => {
                match snapshot.trail_volatility() {
                    Some(atr) => {
                        let k = if target == ProtectionTier::TightTrail {
                            self.config.k2
                        } else {
                            self.config.k1
                        };
                        let trail = trail_price(position.side, price, atr * k, position.entry_price);
                        (target, Some(trail))
                    }
                    // The breakeven lock needs no volatility input.
                    None if position.tier < ProtectionTier::Breakeven => {
                        warn!(
                            position_id = %position.id,
                            target = ?target,
                            atr = ?snapshot.atr,
                            "Volatility input missing, locking breakeven only"
                        );
                        (ProtectionTier::Breakeven, Some(position.entry_price))
                    }
                    None => {
                        warn!(
                            position_id = %position.id,
                            tier = ?target,
                            atr = ?snapshot.atr,
                            "Volatility input missing or non-positive, holding stop"
                        );
                        return StopAdvance::Skipped;
                    }
                }
            }
            ProtectionTier::Closed => return StopAdvance::Closed,
        };

        if tier != position.tier {
            info!(
                position_id = %position.id,
                from = ?position.tier,
                to = ?tier,
                r = %r,
                "Protection tier advanced"
            );
            position.tier = tier;
        }
        position.last_updated = snapshot.observed_at;

        let old_stop = position.trailing_stop;
        match candidate {
            Some(new_stop) if position.side.is_tighter(new_stop, old_stop) => {
                position.trailing_stop = new_stop;
                debug!(
                    position_id = %position.id,
                    old_stop = %old_stop,
                    new_stop = %new_stop,
                    "Trailing stop tightened"
                );
                let intent = OrderIntent::protective_stop(position, new_stop, tier.is_trailing());
                StopAdvance::Moved {
                    tier,
                    old_stop,
                    new_stop,
                    intent,
                }
            }
            _ => StopAdvance::Held { tier },
        }
    }

    /// Move `position` to the terminal tier.
    pub fn close(&self, position: &mut Position) {
        if position.tier != ProtectionTier::Closed {
            info!(position_id = %position.id, from = ?position.tier, "Protection closed");
            position.tier = ProtectionTier::Closed;
        }
    }
}

/// Trail `offset` behind `price`, never looser than `entry`.
fn trail_price(side: PositionSide, price: Decimal, offset: Decimal, entry: Decimal) -> Decimal {
    match side {
        PositionSide::Long => (price - offset).max(entry),
        PositionSide::Short => (price + offset).min(entry),
    }
}
