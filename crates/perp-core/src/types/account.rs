//! Account-level state owned by the orchestrator.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Equity and margin bookkeeping for the single logical account.
///
/// Equity may go negative transiently after a liquidation; the margin
/// invariant `used_margin <= equity * max_leverage` is only enforced at sizing
/// time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub equity: Decimal,
    pub used_margin: Decimal,
    pub realized_pnl: Decimal,
    pub open_positions: usize,
}

impl AccountState {
    pub fn new(equity: Decimal) -> Self {
        Self {
            equity,
            used_margin: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            open_positions: 0,
        }
    }

    /// Margin still available before the leverage cap is hit.
    pub fn margin_headroom(&self, max_leverage: Decimal) -> Decimal {
        self.equity * max_leverage - self.used_margin
    }

    /// Whether reserving `margin` keeps the account within the leverage cap.
    pub fn can_reserve(&self, margin: Decimal, max_leverage: Decimal) -> bool {
        self.used_margin + margin <= self.equity * max_leverage
    }

    /// Record a newly opened position and its margin.
    pub fn reserve_margin(&mut self, margin: Decimal) {
        self.used_margin += margin;
        self.open_positions += 1;
    }

    /// Release margin from a (partially) closed position.
    pub fn release_margin(&mut self, margin: Decimal, position_closed: bool) {
        self.used_margin = (self.used_margin - margin).max(Decimal::ZERO);
        if position_closed {
            self.open_positions = self.open_positions.saturating_sub(1);
        }
    }

    /// Apply a realized profit or loss.
    pub fn apply_realized_pnl(&mut self, pnl: Decimal) {
        self.equity += pnl;
        self.realized_pnl += pnl;
    }
}
