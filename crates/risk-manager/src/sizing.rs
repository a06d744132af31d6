//! Risk-based position sizing for leveraged entries.
//!
//! Sizing is pure: the same request always yields the same result, and every
//! validation failure rejects the request instead of clamping it.

use perp_core::types::PositionSide;
use perp_core::EngineSettings;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation failures raised by the sizer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SizingError {
    #[error("Risk fraction {0} outside (0, 1]")]
    InvalidRiskFraction(Decimal),

    #[error("Stop price equals entry price {0}")]
    DegenerateStop(Decimal),

    #[error("Liquidation price {liquidation_price} outside (0, {ceiling})")]
    LiquidationOutOfRange {
        liquidation_price: Decimal,
        ceiling: Decimal,
    },

    #[error("Account equity must be positive, got {0}")]
    InvalidEquity(Decimal),

    #[error("Prices must be positive (entry {entry}, stop {stop})")]
    InvalidPrice { entry: Decimal, stop: Decimal },

    #[error("Leverage {leverage} outside [1, {max}]")]
    InvalidLeverage { leverage: Decimal, max: Decimal },

    #[error("Stop {stop} is on the profitable side of entry {entry} for a {side:?} position")]
    StopOnWrongSide {
        side: PositionSide,
        entry: Decimal,
        stop: Decimal,
    },

    #[error("Max loss {max_loss} does not match risk budget {budget}")]
    SizingInvariantViolated { max_loss: Decimal, budget: Decimal },

    #[error("Arithmetic overflow while sizing")]
    ArithmeticOverflow,
}

/// Configuration for the risk sizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Fraction of margin held back as headroom, in [0, 1).
    pub safety_buffer: Decimal,
    /// Highest leverage a single position may use.
    pub max_leverage: Decimal,
    /// Liquidation prices at or above `entry * multiple` are rejected.
    pub liquidation_ceiling_multiple: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            safety_buffer: Decimal::new(20, 2), // 20%
            max_leverage: Decimal::new(100, 0),
            liquidation_ceiling_multiple: Decimal::new(2, 0),
        }
    }
}

impl From<&EngineSettings> for SizingConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            safety_buffer: settings.safety_buffer,
            max_leverage: settings.max_leverage,
            liquidation_ceiling_multiple: settings.liquidation_ceiling_multiple,
        }
    }
}

/// Inputs for one sizing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingRequest {
    pub account_equity: Decimal,
    pub risk_fraction: Decimal,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub leverage: Decimal,
    pub side: PositionSide,
}

/// Result of a successful sizing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSizing {
    pub quantity: Decimal,
    /// `quantity * entry_price`.
    pub notional: Decimal,
    pub margin_required: Decimal,
    /// Margin after the safety buffer is held back.
    pub usable_margin: Decimal,
    pub liquidation_price: Decimal,
    /// Loss if the stop is hit; equals the risk budget.
    pub max_loss: Decimal,
}

/// A take-profit target expressed as a reward-to-risk multiple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    pub ratio: Decimal,
    pub price: Decimal,
    pub gain_pct: Decimal,
}

/// Relative tolerance for the max-loss invariant (1e-6).
fn invariant_tolerance() -> Decimal {
    Decimal::new(1, 6)
}

/// Pure position sizer.
#[derive(Debug, Clone, Default)]
pub struct RiskSizer {
    config: SizingConfig,
}

impl RiskSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// Size a position so that hitting the stop loses exactly
    /// `account_equity * risk_fraction`.
    pub fn size(&self, request: &SizingRequest) -> Result<PositionSizing, SizingError> {
        let SizingRequest {
            account_equity,
            risk_fraction,
            entry_price,
            stop_price,
            leverage,
            side,
        } = *request;

        if risk_fraction <= Decimal::ZERO || risk_fraction > Decimal::ONE {
            return Err(SizingError::InvalidRiskFraction(risk_fraction));
        }
        if account_equity <= Decimal::ZERO {
            return Err(SizingError::InvalidEquity(account_equity));
        }
        if entry_price <= Decimal::ZERO || stop_price <= Decimal::ZERO {
            return Err(SizingError::InvalidPrice {
                entry: entry_price,
                stop: stop_price,
            });
        }
        if leverage < Decimal::ONE || leverage > self.config.max_leverage {
            return Err(SizingError::InvalidLeverage {
                leverage,
                max: self.config.max_leverage,
            });
        }
        if entry_price == stop_price {
            return Err(SizingError::DegenerateStop(entry_price));
        }
        if side.favourable_move(entry_price, stop_price) > Decimal::ZERO {
            return Err(SizingError::StopOnWrongSide {
                side,
                entry: entry_price,
                stop: stop_price,
            });
        }

        let stop_distance = (entry_price - stop_price).abs();
        let budget = mul(account_equity, risk_fraction)?;
        let quantity = div(budget, stop_distance)?;
        let notional = mul(quantity, entry_price)?;
        let margin_required = div(notional, leverage)?;
        let usable_margin = mul(margin_required, Decimal::ONE - self.config.safety_buffer)?;

        let cushion = div(usable_margin, quantity)?;
        let liquidation_price = match side {
            PositionSide::Long => entry_price - cushion,
            PositionSide::Short => entry_price + cushion,
        };
        let ceiling = mul(entry_price, self.config.liquidation_ceiling_multiple)?;
        if liquidation_price <= Decimal::ZERO || liquidation_price >= ceiling {
            return Err(SizingError::LiquidationOutOfRange {
                liquidation_price,
                ceiling,
            });
        }

        let max_loss = mul(quantity, stop_distance)?;
        if (max_loss - budget).abs() > budget * invariant_tolerance() {
            return Err(SizingError::SizingInvariantViolated { max_loss, budget });
        }

        Ok(PositionSizing {
            quantity,
            notional,
            margin_required,
            usable_margin,
            liquidation_price,
            max_loss,
        })
    }
}

/// Reward-to-risk multiples for a standard take-profit ladder.
pub const DEFAULT_TAKE_PROFIT_RATIOS: [Decimal; 3] = [
    Decimal::from_parts(3, 0, 0, false, 0),
    Decimal::from_parts(5, 0, 0, false, 0),
    Decimal::from_parts(10, 0, 0, false, 0),
];

/// Take-profit prices at the given reward-to-risk multiples.
pub fn take_profit_levels(
    entry_price: Decimal,
    stop_price: Decimal,
    side: PositionSide,
    ratios: &[Decimal],
) -> Vec<TakeProfitLevel> {
    let stop_distance = (entry_price - stop_price).abs();
    ratios
        .iter()
        .map(|&ratio| {
            let price = match side {
                PositionSide::Long => entry_price + stop_distance * ratio,
                PositionSide::Short => entry_price - stop_distance * ratio,
            };
            let gain_pct = if entry_price.is_zero() {
                Decimal::ZERO
            } else {
                side.favourable_move(entry_price, price) / entry_price * Decimal::ONE_HUNDRED
            };
            TakeProfitLevel {
                ratio,
                price,
                gain_pct,
            }
        })
        .collect()
}

fn mul(a: Decimal, b: Decimal) -> Result<Decimal, SizingError> {
    a.checked_mul(b).ok_or(SizingError::ArithmeticOverflow)
}

fn div(a: Decimal, b: Decimal) -> Result<Decimal, SizingError> {
    a.checked_div(b).ok_or(SizingError::ArithmeticOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request(side: PositionSide, entry: i64, stop: i64) -> SizingRequest {
        SizingRequest {
            account_equity: Decimal::new(10000, 0),
            risk_fraction: Decimal::new(5, 2),
            entry_price: Decimal::new(entry, 0),
            stop_price: Decimal::new(stop, 0),
            leverage: Decimal::new(10, 0),
            side,
        }
    }

    #[test]
    fn test_btc_long_sizing() {
        let sizer = RiskSizer::default();
        let sizing = sizer
            .size(&request(PositionSide::Long, 95000, 94000))
            .unwrap();

        assert_eq!(sizing.quantity, Decimal::new(5, 1));
        assert_eq!(sizing.max_loss, Decimal::new(500, 0));
        assert_eq!(sizing.margin_required, Decimal::new(4750, 0));
        assert_eq!(sizing.usable_margin, Decimal::new(3800, 0));
        // 95000 - 3800 / 0.5
        assert_eq!(sizing.liquidation_price, Decimal::new(87400, 0));
        assert!(sizing.liquidation_price < Decimal::new(94000, 0));
    }

    #[test]
    fn test_short_liquidation_above_entry() {
        let sizer = RiskSizer::default();
        let sizing = sizer
            .size(&request(PositionSide::Short, 95000, 96000))
            .unwrap();

        assert_eq!(sizing.liquidation_price, Decimal::new(102600, 0));
        assert_eq!(sizing.max_loss, Decimal::new(500, 0));
    }

    #[test]
    fn test_invalid_risk_fraction() {
        let sizer = RiskSizer::default();
        for fraction in [Decimal::ZERO, Decimal::new(-1, 2), Decimal::new(101, 2)] {
            let mut req = request(PositionSide::Long, 95000, 94000);
            req.risk_fraction = fraction;
            assert_eq!(
                sizer.size(&req),
                Err(SizingError::InvalidRiskFraction(fraction))
            );
        }

        let mut req = request(PositionSide::Long, 95000, 94000);
        req.risk_fraction = Decimal::ONE;
        assert!(sizer.size(&req).is_ok());
    }

    #[test]
    fn test_degenerate_stop() {
        let sizer = RiskSizer::default();
        assert_eq!(
            sizer.size(&request(PositionSide::Long, 95000, 95000)),
            Err(SizingError::DegenerateStop(Decimal::new(95000, 0)))
        );
    }

    #[test]
    fn test_liquidation_out_of_range() {
        // 1x leverage with no buffer puts a long's liquidation at zero.
        let sizer = RiskSizer::new(SizingConfig {
            safety_buffer: Decimal::ZERO,
            ..Default::default()
        });
        let mut req = request(PositionSide::Long, 95000, 94000);
        req.leverage = Decimal::ONE;
        assert!(matches!(
            sizer.size(&req),
            Err(SizingError::LiquidationOutOfRange { .. })
        ));

        // Same combination on a short reaches the 2x ceiling.
        let mut req = request(PositionSide::Short, 95000, 96000);
        req.leverage = Decimal::ONE;
        assert!(matches!(
            sizer.size(&req),
            Err(SizingError::LiquidationOutOfRange { .. })
        ));
    }

    #[test]
    fn test_stop_on_wrong_side() {
        let sizer = RiskSizer::default();
        assert!(matches!(
            sizer.size(&request(PositionSide::Long, 95000, 96000)),
            Err(SizingError::StopOnWrongSide { .. })
        ));
        assert!(matches!(
            sizer.size(&request(PositionSide::Short, 95000, 94000)),
            Err(SizingError::StopOnWrongSide { .. })
        ));
    }

    #[test]
    fn test_leverage_bounds() {
        let sizer = RiskSizer::default();
        let mut req = request(PositionSide::Long, 95000, 94000);
        req.leverage = Decimal::new(101, 0);
        assert!(matches!(
            sizer.size(&req),
            Err(SizingError::InvalidLeverage { .. })
        ));
        req.leverage = Decimal::new(5, 1);
        assert!(matches!(
            sizer.size(&req),
            Err(SizingError::InvalidLeverage { .. })
        ));
    }

    #[test]
    fn test_take_profit_levels() {
        let ratios = [Decimal::new(3, 0), Decimal::new(10, 0)];
        let long = take_profit_levels(
            Decimal::new(100, 0),
            Decimal::new(80, 0),
            PositionSide::Long,
            &ratios,
        );
        assert_eq!(long[0].price, Decimal::new(160, 0));
        assert_eq!(long[0].gain_pct, Decimal::new(60, 0));
        assert_eq!(long[1].price, Decimal::new(300, 0));

        let short = take_profit_levels(
            Decimal::new(100, 0),
            Decimal::new(110, 0),
            PositionSide::Short,
            &ratios,
        );
        assert_eq!(short[0].price, Decimal::new(70, 0));
        assert_eq!(short[0].gain_pct, Decimal::new(30, 0));
    }

    #[test]
    fn test_default_ladder() {
        let prices: Vec<Decimal> = take_profit_levels(
            Decimal::new(95000, 0),
            Decimal::new(94000, 0),
            PositionSide::Long,
            &DEFAULT_TAKE_PROFIT_RATIOS,
        )
        .into_iter()
        .map(|level| level.price)
        .collect();
        assert_eq!(
            prices,
            vec![
                Decimal::new(98000, 0),
                Decimal::new(100000, 0),
                Decimal::new(105000, 0)
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_max_loss_matches_risk_budget(
            equity_cents in 10_000i64..100_000_000,
            risk_pct in 1i64..=100,
            entry_cents in 10_000i64..10_000_000,
            stop_pct in 1i64..50,
            leverage in 2i64..=50,
            buffer_pct in 0i64..50,
            is_long in any::<bool>(),
        ) {
            let entry = Decimal::new(entry_cents, 2);
            let offset = entry * Decimal::new(stop_pct, 2);
            let side = if is_long { PositionSide::Long } else { PositionSide::Short };
            let stop = match side {
                PositionSide::Long => entry - offset,
                PositionSide::Short => entry + offset,
            };
            let sizer = RiskSizer::new(SizingConfig {
                safety_buffer: Decimal::new(buffer_pct, 2),
                ..Default::default()
            });
            let req = SizingRequest {
                account_equity: Decimal::new(equity_cents, 2),
                risk_fraction: Decimal::new(risk_pct, 2),
                entry_price: entry,
                stop_price: stop,
                leverage: Decimal::new(leverage, 0),
                side,
            };

            let sizing = sizer.size(&req).unwrap();
            let budget = req.account_equity * req.risk_fraction;
            let tolerance = budget * Decimal::new(1, 6);
            prop_assert!((sizing.quantity * (entry - stop).abs() - budget).abs() <= tolerance);
            prop_assert!(sizing.liquidation_price > Decimal::ZERO);
            match side {
                PositionSide::Long => prop_assert!(sizing.liquidation_price < entry),
                PositionSide::Short => prop_assert!(sizing.liquidation_price > entry),
            }
        }
    }
}
