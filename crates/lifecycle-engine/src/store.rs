//! Account and position store owned by the orchestrator.

use std::collections::HashMap;

use perp_core::types::{AccountState, Position};
use risk_manager::{FeeModel, SlippageCheck};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Effect of an exit fill on the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FillOutcome {
    pub position_id: Uuid,
    pub filled: Decimal,
    pub gross_pnl: Decimal,
    /// Entry and exit fees on the filled quantity.
    pub fees: Decimal,
    /// Net of fees; this is what reaches equity.
    pub realized_pnl: Decimal,
    pub released_margin: Decimal,
    /// Deviation from the reference price, when one was given.
    pub slippage: Option<SlippageCheck>,
    /// The position is flat and has been removed.
    pub closed: bool,
}

/// Single source of truth for account and position state.
#[derive(Debug, Clone)]
pub struct PositionStore {
    account: AccountState,
    positions: HashMap<Uuid, Position>,
    fees: FeeModel,
}

impl PositionStore {
    /// Store that books fills without fees.
    pub fn new(equity: Decimal) -> Self {
        Self::with_fee_model(equity, FeeModel::frictionless())
    }

    pub fn with_fee_model(equity: Decimal, fees: FeeModel) -> Self {
        Self {
            account: AccountState::new(equity),
            positions: HashMap::new(),
            fees,
        }
    }

    pub fn fee_model(&self) -> &FeeModel {
        &self.fees
    }

    pub fn account(&self) -> &AccountState {
        &self.account
    }

    pub fn get(&self, id: &Uuid) -> Option<&Position> {
        self.positions.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Position> {
        self.positions.get_mut(id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn positions_mut(&mut self) -> impl Iterator<Item = &mut Position> {
        self.positions.values_mut()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.positions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Add a newly opened position and reserve its margin.
    pub fn insert(&mut self, position: Position) {
        self.account.reserve_margin(position.margin);
        self.positions.insert(position.id, position);
    }

    /// Drop a position that never opened, releasing its margin without P&L.
    pub fn discard(&mut self, id: &Uuid) -> Option<Position> {
        let position = self.positions.remove(id)?;
        self.account.release_margin(position.margin, true);
        Some(position)
    }

    /// Apply an exit fill of `quantity` at `price`. `reference_price` is the
    /// price the exit was meant to trade at, for the slippage check.
    pub fn apply_fill(
        &mut self,
        id: Uuid,
        quantity: Decimal,
        price: Decimal,
        reference_price: Option<Decimal>,
    ) -> Result<FillOutcome> {
        if quantity <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(EngineError::InvalidFill {
                message: format!("quantity {} and price {} must be positive", quantity, price),
            });
        }
        let position = self
            .positions
            .get_mut(&id)
            .ok_or(EngineError::PositionNotFound(id))?;
        if quantity > position.quantity {
            return Err(EngineError::InvalidFill {
                message: format!(
                    "fill {} exceeds open quantity {}",
                    quantity, position.quantity
                ),
            });
        }

        let pnl = self
            .fees
            .pnl(position.side, position.entry_price, price, quantity);
        let slippage = reference_price.and_then(|reference| self.fees.check_slippage(reference, price));
        if let Some(check) = slippage.filter(|check| !check.acceptable) {
            warn!(
                position_id = %id,
                price = %price,
                reference_price = ?reference_price,
                slippage_pct = %check.slippage_pct,
                max_slippage_pct = %self.fees.config().max_slippage_pct,
                "Exit fill slipped beyond tolerance"
            );
        }

        let realized_pnl = pnl.net;
        let released_margin = position.reduce(quantity);
        let closed = position.quantity.is_zero();

        self.account.apply_realized_pnl(realized_pnl);
        self.account.release_margin(released_margin, closed);
        if closed {
            self.positions.remove(&id);
        }

        info!(
            position_id = %id,
            filled = %quantity,
            price = %price,
            gross_pnl = %pnl.gross,
            fees = %pnl.fees(),
            realized_pnl = %realized_pnl,
            closed,
            "Exit fill applied"
        );
        Ok(FillOutcome {
            position_id: id,
            filled: quantity,
            gross_pnl: pnl.gross,
            fees: pnl.fees(),
            realized_pnl,
            released_margin,
            slippage,
            closed,
        })
    }

    /// Remove a liquidated position; its remaining margin is lost.
    pub fn apply_liquidation(&mut self, id: Uuid) -> Result<Decimal> {
        let position = self
            .positions
            .remove(&id)
            .ok_or(EngineError::PositionNotFound(id))?;
        let loss = position.margin;
        self.account.apply_realized_pnl(-loss);
        self.account.release_margin(loss, true);
        warn!(
            position_id = %id,
            loss = %loss,
            liquidation_price = %position.liquidation_price,
            "Position liquidated"
        );
        Ok(loss)
    }

    pub fn apply_realized_pnl(&mut self, pnl: Decimal) {
        self.account.apply_realized_pnl(pnl);
    }

    /// Equity plus unrealized P&L of every open position at `price`.
    pub fn mark_to_market(&self, price: Decimal) -> Decimal {
        self.account.equity
            + self
                .positions
                .values()
                .map(|p| p.unrealized_pnl(price))
                .sum::<Decimal>()
    }
}
