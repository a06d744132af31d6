//! Leveraged position types and protection tiers.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::OrderSide;

/// Direction of a leveraged position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens a position in this direction.
    pub fn entry_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces or closes a position in this direction.
    pub fn exit_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }

    /// Signed favourable move from `from` to `to`.
    pub fn favourable_move(self, from: Decimal, to: Decimal) -> Decimal {
        match self {
            Self::Long => to - from,
            Self::Short => from - to,
        }
    }

    /// Whether `candidate` is a strictly more protective stop than `current`.
    pub fn is_tighter(self, candidate: Decimal, current: Decimal) -> bool {
        match self {
            Self::Long => candidate > current,
            Self::Short => candidate < current,
        }
    }
}

/// Trailing protection tier of an open position.
///
/// Tiers are ordered; a position only ever moves forward through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionTier {
    /// Stop sits at the initial stop-loss.
    Initial,
    /// Stop locked at entry (R >= 1).
    Breakeven,
    /// Volatility trail with the wide multiplier (R >= 3).
    ActiveTrail,
    /// Volatility trail with the tight multiplier (R >= 10).
    TightTrail,
    /// Fully closed, liquidated, or handed to an emergency exit.
    Closed,
}

impl ProtectionTier {
    /// Tiers in which the stop follows price.
    pub fn is_trailing(self) -> bool {
        matches!(self, Self::ActiveTrail | Self::TightTrail)
    }
}

/// A leveraged position on the engine's instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub instrument: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    /// Remaining open quantity.
    pub quantity: Decimal,
    pub leverage: Decimal,
    /// Margin still reserved for the remaining quantity.
    pub margin: Decimal,
    pub initial_stop: Decimal,
    pub take_profit: Option<Decimal>,
    pub liquidation_price: Decimal,
    pub opened_at: DateTime<Utc>,
    /// Current protective stop price.
    pub trailing_stop: Decimal,
    pub tier: ProtectionTier,
    pub last_updated: DateTime<Utc>,
}

impl Position {
    /// Create a newly opened position in the `Initial` tier.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instrument: String,
        side: PositionSide,
        entry_price: Decimal,
        quantity: Decimal,
        leverage: Decimal,
        margin: Decimal,
        initial_stop: Decimal,
        take_profit: Option<Decimal>,
        liquidation_price: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            instrument,
            side,
            entry_price,
            quantity,
            leverage,
            margin,
            initial_stop,
            take_profit,
            liquidation_price,
            opened_at: now,
            trailing_stop: initial_stop,
            tier: ProtectionTier::Initial,
            last_updated: now,
        }
    }

    /// Override the open timestamp (positions restored from an external store).
    pub fn with_opened_at(mut self, opened_at: DateTime<Utc>) -> Self {
        self.opened_at = opened_at;
        self.last_updated = opened_at;
        self
    }

    /// Initial risk distance `|entry - initial_stop|`.
    pub fn risk_distance(&self) -> Decimal {
        (self.entry_price - self.initial_stop).abs()
    }

    /// Realized reward-to-risk ratio at `price`, sign-adjusted for side.
    pub fn reward_to_risk(&self, price: Decimal) -> Decimal {
        let risk = self.risk_distance();
        if risk.is_zero() {
            return Decimal::ZERO;
        }
        self.side.favourable_move(self.entry_price, price) / risk
    }

    /// Unrealized P&L of the remaining quantity at `price`.
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.side.favourable_move(self.entry_price, price) * self.quantity
    }

    /// Time since the position was opened.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.opened_at
    }

    /// Whether `price` has crossed the current protective stop.
    pub fn stop_breached(&self, price: Decimal) -> bool {
        match self.side {
            PositionSide::Long => price <= self.trailing_stop,
            PositionSide::Short => price >= self.trailing_stop,
        }
    }

    /// Percentage distance from `price` to the liquidation price.
    ///
    /// Zero once price has reached or passed liquidation.
    pub fn liquidation_distance_pct(&self, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let cushion = self.side.favourable_move(self.liquidation_price, price);
        if cushion <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        cushion / price * Decimal::ONE_HUNDRED
    }

    pub fn is_closed(&self) -> bool {
        self.tier == ProtectionTier::Closed || self.quantity <= Decimal::ZERO
    }

    /// Reduce the open quantity by an exit fill.
    ///
    /// Returns the margin released by the fill.
    pub fn reduce(&mut self, filled: Decimal) -> Decimal {
        let filled = filled.min(self.quantity);
        let released = if self.quantity.is_zero() {
            Decimal::ZERO
        } else {
            self.margin * filled / self.quantity
        };
        self.quantity -= filled;
        self.margin -= released;
        if self.quantity.is_zero() {
            self.margin = Decimal::ZERO;
            self.tier = ProtectionTier::Closed;
        }
        self.last_updated = Utc::now();
        released
    }
}
