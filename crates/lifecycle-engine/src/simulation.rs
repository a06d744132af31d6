//! Random-walk health feed for paper runs.

use std::collections::VecDeque;

use chrono::Utc;
use perp_core::types::HealthSnapshot;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

/// Ticks kept for the ATR and intraday range estimates.
const WINDOW: usize = 14;

#[derive(Debug, Clone)]
pub struct RandomWalkConfig {
    pub start_price: Decimal,
    /// Largest single-tick move, in basis points.
    pub max_step_bps: i64,
    pub seed: Option<u64>,
}

impl Default for RandomWalkConfig {
    fn default() -> Self {
        Self {
            start_price: Decimal::new(95000, 0),
            max_step_bps: 40, // 0.4%
            seed: None,
        }
    }
}

/// Generates snapshots from a bounded random walk.
pub struct RandomWalkFeed {
    config: RandomWalkConfig,
    rng: StdRng,
    prices: VecDeque<Decimal>,
    peak_equity: Decimal,
}

impl RandomWalkFeed {
    pub fn new(config: RandomWalkConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut prices = VecDeque::with_capacity(WINDOW + 1);
        prices.push_back(config.start_price);
        Self {
            config,
            rng,
            prices,
            peak_equity: Decimal::ZERO,
        }
    }

    pub fn price(&self) -> Decimal {
        self.prices.back().copied().unwrap_or(self.config.start_price)
    }

    /// Step the walk and build a snapshot for the account marked at `equity`.
    pub fn next_snapshot(&mut self, equity: Decimal) -> HealthSnapshot {
        let bps = self
            .rng
            .gen_range(-self.config.max_step_bps..=self.config.max_step_bps);
        let price = (self.price() * (Decimal::ONE + Decimal::new(bps, 4)))
            .round_dp(2)
            .max(Decimal::ONE);
        self.prices.push_back(price);
        if self.prices.len() > WINDOW + 1 {
            self.prices.pop_front();
        }

        let mut snapshot = HealthSnapshot::healthy(price)
            .with_volatility(self.range_pct(price))
            .with_drawdown(self.drawdown_pct(equity))
            .at(Utc::now());
        if let Some(atr) = self.average_true_range() {
            snapshot = snapshot.with_atr(atr);
        }
        snapshot
    }

    /// Mean absolute tick-to-tick move over the window.
    fn average_true_range(&self) -> Option<Decimal> {
        if self.prices.len() < 2 {
            return None;
        }
        let moves: Decimal = self
            .prices
            .iter()
            .zip(self.prices.iter().skip(1))
            .map(|(a, b)| (*b - *a).abs())
            .sum();
        Some(moves / Decimal::from(self.prices.len() - 1))
    }

    fn range_pct(&self, price: Decimal) -> Decimal {
        let high = self.prices.iter().copied().max().unwrap_or(price);
        let low = self.prices.iter().copied().min().unwrap_or(price);
        (high - low) / price * Decimal::ONE_HUNDRED
    }

    fn drawdown_pct(&mut self, equity: Decimal) -> Decimal {
        self.peak_equity = self.peak_equity.max(equity);
        if self.peak_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        ((self.peak_equity - equity) / self.peak_equity * Decimal::ONE_HUNDRED)
            .clamp(Decimal::ZERO, Decimal::ONE_HUNDRED)
    }
}
