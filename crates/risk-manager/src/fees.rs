//! Trading fees and fill slippage.
//!
//! Entries rest as limit orders and pay the maker rate; stop and market
//! exits pay the taker rate.

use perp_core::types::PositionSide;
use perp_core::EngineSettings;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which side of the book a fill took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liquidity {
    Maker,
    Taker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,
    /// Percentage, e.g. `0.1` for 0.1%.
    pub max_slippage_pct: Decimal,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            maker_fee_rate: Decimal::new(1, 4), // 0.01%
            taker_fee_rate: Decimal::new(2, 4), // 0.02%
            max_slippage_pct: Decimal::new(1, 1),
        }
    }
}

impl From<&EngineSettings> for FeeConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            maker_fee_rate: settings.maker_fee_rate,
            taker_fee_rate: settings.taker_fee_rate,
            max_slippage_pct: settings.max_slippage_pct,
        }
    }
}

impl FeeConfig {
    /// No fees and no slippage tolerance check.
    pub fn frictionless() -> Self {
        Self {
            maker_fee_rate: Decimal::ZERO,
            taker_fee_rate: Decimal::ZERO,
            max_slippage_pct: Decimal::ONE_HUNDRED,
        }
    }
}

/// Gross and net P&L of a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnlBreakdown {
    pub gross: Decimal,
    pub entry_fee: Decimal,
    pub exit_fee: Decimal,
    pub net: Decimal,
}

impl PnlBreakdown {
    pub fn fees(&self) -> Decimal {
        self.entry_fee + self.exit_fee
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlippageCheck {
    /// Absolute deviation from the intended price, in percent.
    pub slippage_pct: Decimal,
    pub acceptable: bool,
}

#[derive(Debug, Clone)]
pub struct FeeModel {
    config: FeeConfig,
}

impl Default for FeeModel {
    fn default() -> Self {
        Self::new(FeeConfig::default())
    }
}

impl FeeModel {
    pub fn new(config: FeeConfig) -> Self {
        Self { config }
    }

    pub fn frictionless() -> Self {
        Self::new(FeeConfig::frictionless())
    }

    pub fn config(&self) -> &FeeConfig {
        &self.config
    }

    pub fn fee(&self, notional: Decimal, liquidity: Liquidity) -> Decimal {
        let rate = match liquidity {
            Liquidity::Maker => self.config.maker_fee_rate,
            Liquidity::Taker => self.config.taker_fee_rate,
        };
        notional.abs() * rate
    }

    /// P&L of `quantity` entered at `entry` (maker) and exited at `exit` (taker).
    pub fn pnl(
        &self,
        side: PositionSide,
        entry: Decimal,
        exit: Decimal,
        quantity: Decimal,
    ) -> PnlBreakdown {
        let gross = side.favourable_move(entry, exit) * quantity;
        let entry_fee = self.fee(entry * quantity, Liquidity::Maker);
        let exit_fee = self.fee(exit * quantity, Liquidity::Taker);
        PnlBreakdown {
            gross,
            entry_fee,
            exit_fee,
            net: gross - entry_fee - exit_fee,
        }
    }

    /// Exit price at which the round trip nets zero after fees.
    pub fn breakeven_price(&self, side: PositionSide, entry: Decimal) -> Decimal {
        let maker = self.config.maker_fee_rate;
        let taker = self.config.taker_fee_rate;
        match side {
            PositionSide::Long => entry * (Decimal::ONE + maker) / (Decimal::ONE - taker),
            PositionSide::Short => entry * (Decimal::ONE - maker) / (Decimal::ONE + taker),
        }
    }

    /// `None` when there is no usable intended price.
    pub fn check_slippage(&self, intended: Decimal, actual: Decimal) -> Option<SlippageCheck> {
        if intended <= Decimal::ZERO {
            return None;
        }
        let slippage_pct = (actual - intended).abs() / intended * Decimal::ONE_HUNDRED;
        Some(SlippageCheck {
            slippage_pct,
            acceptable: slippage_pct <= self.config.max_slippage_pct,
        })
    }
}
