//! Configuration management for the perp-guard engine.

use std::env;
use std::path::Path;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Prefix for environment overrides, e.g. `ENGINE_RISK_FRACTION=0.02`.
pub const ENV_PREFIX: &str = "ENGINE";

/// Every recognized engine option, with its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Instrument traded by this engine instance.
    pub instrument: String,
    /// Fraction of equity risked per position, in (0, 1].
    pub risk_fraction: Decimal,
    /// Reserved margin headroom, in [0, 1).
    pub safety_buffer: Decimal,
    /// Account-wide leverage cap on used margin.
    pub max_leverage: Decimal,
    /// Liquidation prices must stay below `entry * liquidation_ceiling_multiple`.
    pub liquidation_ceiling_multiple: Decimal,
    pub breakeven_r: Decimal,
    pub active_trail_r: Decimal,
    pub tight_trail_r: Decimal,
    pub trail_k1: Decimal,
    pub trail_k2: Decimal,
    /// R multiple used for the take-profit when an entry does not give one.
    pub default_take_profit_r: Decimal,
    pub max_drawdown_pct: Decimal,
    pub extreme_volatility_pct: Decimal,
    pub max_hold_seconds: u64,
    pub liquidation_buffer_pct: Decimal,
    /// Fee rate on resting (entry limit) orders.
    pub maker_fee_rate: Decimal,
    /// Fee rate on stop and market exits.
    pub taker_fee_rate: Decimal,
    /// Fill slippage beyond this percentage is reported as unacceptable.
    pub max_slippage_pct: Decimal,
    pub connectivity_grace_secs: u64,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            instrument: "BTCUSDT".to_string(),
            risk_fraction: Decimal::new(5, 2),  // 5% of equity
            safety_buffer: Decimal::new(20, 2), // 20% margin headroom
            max_leverage: Decimal::new(100, 0),
            liquidation_ceiling_multiple: Decimal::new(2, 0),
            breakeven_r: Decimal::ONE,
            active_trail_r: Decimal::new(3, 0),
            tight_trail_r: Decimal::new(10, 0),
            trail_k1: Decimal::new(15, 1), // 1.5x ATR
            trail_k2: Decimal::new(5, 1),  // 0.5x ATR
            default_take_profit_r: Decimal::new(3, 0),
            max_drawdown_pct: Decimal::new(50, 0),
            extreme_volatility_pct: Decimal::new(10, 0),
            max_hold_seconds: 86_400, // 24h
            liquidation_buffer_pct: Decimal::new(5, 0),
            maker_fee_rate: Decimal::new(1, 4), // 0.01%
            taker_fee_rate: Decimal::new(2, 4), // 0.02%
            max_slippage_pct: Decimal::new(1, 1),
            connectivity_grace_secs: 10,
            max_retry_attempts: 5,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
        }
    }
}

impl EngineSettings {
    /// Load settings from `ENGINE_*` environment variables (and `.env`).
    ///
    /// Unset variables fall back to defaults; set but unparsable ones are an
    /// error rather than silently ignored.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let d = Self::default();

        let settings = Self {
            instrument: env::var(env_key("INSTRUMENT")).unwrap_or(d.instrument),
            risk_fraction: env_or("RISK_FRACTION", d.risk_fraction)?,
            safety_buffer: env_or("SAFETY_BUFFER", d.safety_buffer)?,
            max_leverage: env_or("MAX_LEVERAGE", d.max_leverage)?,
            liquidation_ceiling_multiple: env_or(
                "LIQUIDATION_CEILING_MULTIPLE",
                d.liquidation_ceiling_multiple,
            )?,
            breakeven_r: env_or("BREAKEVEN_R", d.breakeven_r)?,
            active_trail_r: env_or("ACTIVE_TRAIL_R", d.active_trail_r)?,
            tight_trail_r: env_or("TIGHT_TRAIL_R", d.tight_trail_r)?,
            trail_k1: env_or("TRAIL_K1", d.trail_k1)?,
            trail_k2: env_or("TRAIL_K2", d.trail_k2)?,
            default_take_profit_r: env_or("DEFAULT_TAKE_PROFIT_R", d.default_take_profit_r)?,
            max_drawdown_pct: env_or("MAX_DRAWDOWN_PCT", d.max_drawdown_pct)?,
            extreme_volatility_pct: env_or("EXTREME_VOLATILITY_PCT", d.extreme_volatility_pct)?,
            max_hold_seconds: env_or("MAX_HOLD_SECONDS", d.max_hold_seconds)?,
            liquidation_buffer_pct: env_or("LIQUIDATION_BUFFER_PCT", d.liquidation_buffer_pct)?,
            maker_fee_rate: env_or("MAKER_FEE_RATE", d.maker_fee_rate)?,
            taker_fee_rate: env_or("TAKER_FEE_RATE", d.taker_fee_rate)?,
            max_slippage_pct: env_or("MAX_SLIPPAGE_PCT", d.max_slippage_pct)?,
            connectivity_grace_secs: env_or("CONNECTIVITY_GRACE_SECS", d.connectivity_grace_secs)?,
            max_retry_attempts: env_or("MAX_RETRY_ATTEMPTS", d.max_retry_attempts)?,
            retry_base_delay_ms: env_or("RETRY_BASE_DELAY_MS", d.retry_base_delay_ms)?,
            retry_max_delay_ms: env_or("RETRY_MAX_DELAY_MS", d.retry_max_delay_ms)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a config file (TOML, YAML, JSON...) with
    /// `ENGINE_*` environment variables layered on top.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings: Self = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject option combinations that would make the engine unsafe.
    pub fn validate(&self) -> Result<()> {
        if self.risk_fraction <= Decimal::ZERO || self.risk_fraction > Decimal::ONE {
            return Err(config_error(format!(
                "risk_fraction must be in (0, 1], got {}",
                self.risk_fraction
            )));
        }
        if self.safety_buffer < Decimal::ZERO || self.safety_buffer >= Decimal::ONE {
            return Err(config_error(format!(
                "safety_buffer must be in [0, 1), got {}",
                self.safety_buffer
            )));
        }
        if self.max_leverage < Decimal::ONE {
            return Err(config_error(format!(
                "max_leverage must be at least 1, got {}",
                self.max_leverage
            )));
        }
        if self.liquidation_ceiling_multiple <= Decimal::ONE {
            return Err(config_error(format!(
                "liquidation_ceiling_multiple must exceed 1, got {}",
                self.liquidation_ceiling_multiple
            )));
        }
        if !(self.breakeven_r > Decimal::ZERO
            && self.breakeven_r <= self.active_trail_r
            && self.active_trail_r <= self.tight_trail_r)
        {
            return Err(config_error(format!(
                "trail thresholds must satisfy 0 < breakeven_r <= active_trail_r <= tight_trail_r, got {} / {} / {}",
                self.breakeven_r, self.active_trail_r, self.tight_trail_r
            )));
        }
        if self.trail_k1 <= Decimal::ZERO || self.trail_k2 <= Decimal::ZERO {
            return Err(config_error(format!(
                "trail multipliers must be positive, got k1={} k2={}",
                self.trail_k1, self.trail_k2
            )));
        }
        if self.default_take_profit_r <= Decimal::ZERO {
            return Err(config_error("default_take_profit_r must be positive".to_string()));
        }
        if self.max_drawdown_pct <= Decimal::ZERO || self.max_drawdown_pct > Decimal::ONE_HUNDRED {
            return Err(config_error(format!(
                "max_drawdown_pct must be in (0, 100], got {}",
                self.max_drawdown_pct
            )));
        }
        if self.extreme_volatility_pct <= Decimal::ZERO {
            return Err(config_error("extreme_volatility_pct must be positive".to_string()));
        }
        if self.max_hold_seconds == 0 || self.max_hold_seconds > MAX_HOLD_SECONDS_LIMIT {
            return Err(config_error(format!(
                "max_hold_seconds must be in [1, {}], got {}",
                MAX_HOLD_SECONDS_LIMIT, self.max_hold_seconds
            )));
        }
        if self.liquidation_buffer_pct < Decimal::ZERO {
            return Err(config_error("liquidation_buffer_pct must be non-negative".to_string()));
        }
        for (name, rate) in [
            ("maker_fee_rate", self.maker_fee_rate),
            ("taker_fee_rate", self.taker_fee_rate),
        ] {
            if rate < Decimal::ZERO || rate >= Decimal::ONE {
                return Err(config_error(format!("{} must be in [0, 1), got {}", name, rate)));
            }
        }
        if self.max_slippage_pct < Decimal::ZERO || self.max_slippage_pct > Decimal::ONE_HUNDRED {
            return Err(config_error(format!(
                "max_slippage_pct must be in [0, 100], got {}",
                self.max_slippage_pct
            )));
        }
        if self.max_retry_attempts == 0 {
            return Err(config_error("max_retry_attempts must be at least 1".to_string()));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(config_error(format!(
                "retry_base_delay_ms ({}) exceeds retry_max_delay_ms ({})",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Largest hold duration chrono can represent, in seconds.
const MAX_HOLD_SECONDS_LIMIT: u64 = (i64::MAX / 1000) as u64;

fn env_key(name: &str) -> String {
    format!("{}_{}", ENV_PREFIX, name)
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    let key = env_key(name);
    match env::var(&key) {
        Ok(raw) => raw.trim().parse().map_err(|_| Error::Config {
            message: format!("{} has an invalid value: {:?}", key, raw),
        }),
        Err(_) => Ok(default),
    }
}

fn config_error(message: String) -> Error {
    Error::Config { message }
}
