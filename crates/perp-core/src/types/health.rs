//! Per-tick account and market health input.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Externally supplied health snapshot, valid for a single tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Current instrument price.
    pub price: Decimal,
    /// Realized volatility estimate, percent of price (intraday range).
    pub volatility: Decimal,
    /// Average true range in price units; drives the trailing stop.
    pub atr: Option<Decimal>,
    pub api_connected: bool,
    /// Account drawdown, percent in [0, 100].
    pub drawdown_pct: Decimal,
    pub seconds_since_heartbeat: u64,
    pub observed_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// A healthy snapshot at `price` with no volatility measure attached.
    pub fn healthy(price: Decimal) -> Self {
        Self {
            price,
            volatility: Decimal::ZERO,
            atr: None,
            api_connected: true,
            drawdown_pct: Decimal::ZERO,
            seconds_since_heartbeat: 0,
            observed_at: Utc::now(),
        }
    }

    pub fn with_atr(mut self, atr: Decimal) -> Self {
        self.atr = Some(atr);
        self
    }

    pub fn with_volatility(mut self, volatility_pct: Decimal) -> Self {
        self.volatility = volatility_pct;
        self
    }

    pub fn with_drawdown(mut self, drawdown_pct: Decimal) -> Self {
        self.drawdown_pct = drawdown_pct;
        self
    }

    pub fn disconnected(mut self, seconds_since_heartbeat: u64) -> Self {
        self.api_connected = false;
        self.seconds_since_heartbeat = seconds_since_heartbeat;
        self
    }

    pub fn at(mut self, observed_at: DateTime<Utc>) -> Self {
        self.observed_at = observed_at;
        self
    }

    /// Usable volatility measure for trailing, if present and positive.
    pub fn trail_volatility(&self) -> Option<Decimal> {
        self.atr.filter(|atr| *atr > Decimal::ZERO)
    }

    /// Reject snapshots the engine cannot reason about.
    pub fn validate(&self) -> Result<()> {
        if self.price <= Decimal::ZERO {
            return Err(Error::InvalidSnapshot {
                message: format!("price must be positive, got {}", self.price),
            });
        }
        if self.volatility < Decimal::ZERO {
            return Err(Error::InvalidSnapshot {
                message: format!("volatility must be non-negative, got {}", self.volatility),
            });
        }
        if self.drawdown_pct < Decimal::ZERO || self.drawdown_pct > Decimal::ONE_HUNDRED {
            return Err(Error::InvalidSnapshot {
                message: format!("drawdown_pct must be in [0, 100], got {}", self.drawdown_pct),
            });
        }
        Ok(())
    }
}
