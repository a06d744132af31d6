//! Lifecycle orchestrator.
//!
//! Owns the account and position store and drives one strictly sequential
//! tick at a time: circuit breaker first, emergency closes next, then the
//! trailing stop for every position still open. Order delivery runs in the
//! execution queue and reports back through its event stream.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use perp_core::types::{
    CircuitDecision, CorrelationId, EngineEvent, HealthSnapshot, IntentPurpose, OrderIntent,
    Position, PositionSide, TripReason, TripScope,
};
use perp_core::EngineSettings;
use risk_manager::{
    take_profit_levels, CircuitBreaker, CircuitBreakerConfig, FeeConfig, FeeModel, RiskSizer,
    SizingConfig, SizingRequest, StopAdvance, TrailingStopConfig, TrailingStopController,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use trading_engine::{ExecutionConfig, ExecutionQueue, VenueAdapter};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::{FillOutcome, PositionStore};

/// What the engine currently allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    Normal,
    /// Extreme volatility; existing positions keep trailing.
    EntriesHalted,
    /// Account-wide force close in progress.
    Flattening,
    /// A critical delivery failed. Latched until acknowledged.
    OperatorRequired,
}

/// Request to open a new position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRequest {
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub leverage: Decimal,
    /// Defaults to the configured R multiple.
    pub take_profit: Option<Decimal>,
    /// Defaults to the configured risk fraction.
    pub risk_fraction: Option<Decimal>,
}

impl EntryRequest {
    pub fn new(
        side: PositionSide,
        entry_price: Decimal,
        stop_price: Decimal,
        leverage: Decimal,
    ) -> Self {
        Self {
            side,
            entry_price,
            stop_price,
            leverage,
            take_profit: None,
            risk_fraction: None,
        }
    }
}

/// Summary of one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub observed_at: DateTime<Utc>,
    /// Result of the full trigger table.
    pub decision: CircuitDecision,
    pub mode: TradingMode,
    /// Positions handed to an emergency close this tick.
    pub force_closed: Vec<Uuid>,
    pub stops_moved: Vec<Uuid>,
    /// Positions whose trail was held for lack of volatility input.
    pub trailing_skipped: Vec<Uuid>,
    /// Positions trading through their stop without a reported fill.
    pub stops_breached: Vec<Uuid>,
    /// Positions whose abandoned stop order was resubmitted.
    pub stops_restored: Vec<Uuid>,
}

pub struct LifecycleOrchestrator {
    settings: EngineSettings,
    store: PositionStore,
    sizer: RiskSizer,
    trailing: TrailingStopController,
    breaker: CircuitBreaker,
    queue: ExecutionQueue,
    queue_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    mode: TradingMode,
    /// An extreme volatility halt has been announced and not yet lifted.
    entries_halt_active: bool,
    /// An account-wide trip has been announced and not yet cleared.
    account_trip_active: bool,
    /// Positions with a live emergency close.
    emergency_pending: HashSet<Uuid>,
    /// Positions whose stop order was abandoned by the queue.
    stops_pending_restore: HashSet<Uuid>,
    last_price: Option<Decimal>,
}

impl LifecycleOrchestrator {
    pub fn new(settings: EngineSettings, equity: Decimal, venue: Arc<dyn VenueAdapter>) -> Self {
        let mut queue = ExecutionQueue::new(venue, ExecutionConfig::from(&settings));
        let queue_rx = queue.take_event_receiver();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(
            instrument = %settings.instrument,
            equity = %equity,
            risk_fraction = %settings.risk_fraction,
            "Lifecycle orchestrator initialized"
        );

        Self {
            sizer: RiskSizer::new(SizingConfig::from(&settings)),
            trailing: TrailingStopController::new(TrailingStopConfig::from(&settings)),
            breaker: CircuitBreaker::new(CircuitBreakerConfig::from(&settings)),
            store: PositionStore::with_fee_model(
                equity,
                FeeModel::new(FeeConfig::from(&settings)),
            ),
            settings,
            queue,
            queue_rx,
            event_tx,
            event_rx: Some(event_rx),
            mode: TradingMode::Normal,
            entries_halt_active: false,
            account_trip_active: false,
            emergency_pending: HashSet::new(),
            stops_pending_restore: HashSet::new(),
            last_price: None,
        }
    }

    /// Take the engine event receiver (can only be called once).
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.event_rx.take()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    pub fn position(&self, id: &Uuid) -> Option<&Position> {
        self.store.get(id)
    }

    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    pub fn is_emergency_pending(&self, id: &Uuid) -> bool {
        self.emergency_pending.contains(id)
    }

    /// Clear a latched operator alert.
    pub fn acknowledge_operator_alert(&mut self) {
        if self.mode == TradingMode::OperatorRequired {
            info!("Operator alert acknowledged");
            self.mode = TradingMode::Normal;
        }
    }

    /// Size and open a position, then queue its entry and initial stop.
    pub fn open_position(&mut self, request: EntryRequest) -> Result<Uuid> {
        match self.mode {
            TradingMode::Normal => {}
            TradingMode::OperatorRequired => return Err(EngineError::OperatorAttentionRequired),
            mode => return Err(EngineError::EntriesHalted { mode }),
        }

        let account = self.store.account();
        let sizing = self.sizer.size(&SizingRequest {
            account_equity: account.equity,
            risk_fraction: request.risk_fraction.unwrap_or(self.settings.risk_fraction),
            entry_price: request.entry_price,
            stop_price: request.stop_price,
            leverage: request.leverage,
            side: request.side,
        })?;

        if !account.can_reserve(sizing.margin_required, self.settings.max_leverage) {
            return Err(EngineError::MarginLimitExceeded {
                required: sizing.margin_required,
                headroom: account.margin_headroom(self.settings.max_leverage),
            });
        }

        let take_profit = request.take_profit.or_else(|| {
            take_profit_levels(
                request.entry_price,
                request.stop_price,
                request.side,
                &[self.settings.default_take_profit_r],
            )
            .first()
            .map(|level| level.price)
        });

        let position = Position::new(
            self.settings.instrument.clone(),
            request.side,
            request.entry_price,
            sizing.quantity,
            request.leverage,
            sizing.margin_required,
            request.stop_price,
            take_profit,
            sizing.liquidation_price,
        );
        let id = position.id;

        info!(
            position_id = %id,
            side = ?position.side,
            entry = %position.entry_price,
            stop = %position.initial_stop,
            quantity = %position.quantity,
            liquidation_price = %position.liquidation_price,
            max_loss = %sizing.max_loss,
            breakeven_after_fees = %self
                .store
                .fee_model()
                .breakeven_price(position.side, position.entry_price),
            "Position opened"
        );

        self.queue.submit(OrderIntent::entry(&position));
        self.queue
            .submit(OrderIntent::protective_stop(&position, position.initial_stop, false));
        self.store.insert(position);
        Ok(id)
    }

    /// Process one health snapshot.
    pub fn on_tick(&mut self, snapshot: &HealthSnapshot) -> Result<TickReport> {
        self.drain_execution_events();
        snapshot.validate()?;
        self.last_price = Some(snapshot.price);

        let now = snapshot.observed_at;
        let decision = self
            .breaker
            .evaluate(snapshot, self.store.account(), self.store.positions(), now);

        let mut report = TickReport {
            observed_at: now,
            decision: decision.clone(),
            mode: self.mode,
            force_closed: Vec::new(),
            stops_moved: Vec::new(),
            trailing_skipped: Vec::new(),
            stops_breached: Vec::new(),
            stops_restored: Vec::new(),
        };

        let mut next_mode = TradingMode::Normal;
        let mut halted = false;
        let mut flattening = false;
        let mut current = decision;
        loop {
            match current {
                CircuitDecision::Continue => break,
                CircuitDecision::HaltNewEntries { volatility_pct } => {
                    // Announced once per halt, whatever mode is latched.
                    if !self.entries_halt_active {
                        warn!(volatility_pct = %volatility_pct, "New entries halted");
                        self.emit(EngineEvent::CircuitTripped {
                            reason: TripReason::ExtremeVolatility,
                            scope: TripScope::NewEntries,
                            position_ids: Vec::new(),
                        });
                    }
                    halted = true;
                    next_mode = TradingMode::EntriesHalted;
                    // Per-position exits still apply while entries are halted.
                    current = self.breaker.evaluate_position_rules(
                        snapshot,
                        self.store.positions(),
                        now,
                    );
                }
                CircuitDecision::ForceCloseAll { reason, scope } => {
                    let account_wide = scope == TripScope::Account;
                    let targets = match &scope {
                        TripScope::Account => self.store.ids(),
                        TripScope::Positions(ids) => ids.clone(),
                        TripScope::NewEntries => Vec::new(),
                    };
                    if account_wide {
                        self.queue.cancel_non_critical(&self.settings.instrument);
                    }

                    let closed = self.force_close(&targets, reason);
                    if !closed.is_empty() || (account_wide && !self.account_trip_active) {
                        error!(reason = ?reason, positions = ?closed, "Circuit breaker tripped");
                        self.emit(EngineEvent::CircuitTripped {
                            reason,
                            scope,
                            position_ids: closed.clone(),
                        });
                    }
                    report.force_closed.extend(closed);

                    if account_wide {
                        flattening = true;
                        next_mode = TradingMode::Flattening;
                        if self.entries_halt_active {
                            halted = true;
                        }
                        break;
                    }
                    current = self.breaker.evaluate_position_rules(
                        snapshot,
                        self.store.positions(),
                        now,
                    );
                }
            }
        }

        if self.entries_halt_active && !halted {
            info!("Volatility halt lifted");
        }
        self.entries_halt_active = halted;
        self.account_trip_active = flattening;

        if self.mode != TradingMode::OperatorRequired {
            if self.mode != next_mode {
                info!(from = ?self.mode, to = ?next_mode, "Trading mode changed");
            }
            self.mode = next_mode;
        }

        self.resubmit_stranded_closes();
        self.restore_abandoned_stops(&mut report);
        self.advance_trailing_stops(snapshot, &mut report);

        report.mode = self.mode;
        debug!(
            price = %snapshot.price,
            open_positions = self.store.len(),
            mode = ?self.mode,
            "Tick processed"
        );
        Ok(report)
    }

    /// Apply an exit fill reported by the venue.
    ///
    /// Slippage is measured against the protective stop, or against the last
    /// observed price once the position is under an emergency close.
    pub fn apply_fill(
        &mut self,
        position_id: Uuid,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<FillOutcome> {
        let reference_price = self.store.get(&position_id).and_then(|position| {
            if position.is_closed() {
                self.last_price
            } else {
                Some(position.trailing_stop)
            }
        });
        let outcome = self
            .store
            .apply_fill(position_id, quantity, price, reference_price)?;
        if outcome.closed {
            self.retire(position_id);
        }
        Ok(outcome)
    }

    /// Record a venue liquidation. Returns the margin lost.
    pub fn apply_liquidation(&mut self, position_id: Uuid) -> Result<Decimal> {
        let loss = self.store.apply_liquidation(position_id)?;
        self.retire(position_id);
        Ok(loss)
    }

    /// Record P&L not tied to a fill (funding, fees).
    pub fn apply_realized_pnl(&mut self, pnl: Decimal) {
        self.store.apply_realized_pnl(pnl);
    }

    /// Drive ticks from `feed` until it closes, handling execution events as
    /// they arrive.
    pub async fn run(&mut self, mut feed: mpsc::Receiver<HealthSnapshot>) {
        let Some(mut execution_rx) = self.queue_rx.take() else {
            error!("Execution event receiver already taken");
            return;
        };
        info!("Lifecycle orchestrator running");

        loop {
            tokio::select! {
                biased;

                Some(event) = execution_rx.recv() => {
                    self.handle_execution_event(event);
                }
                snapshot = feed.recv() => {
                    let Some(snapshot) = snapshot else {
                        break;
                    };
                    if let Err(e) = self.on_tick(&snapshot) {
                        warn!(error = %e, "Tick rejected");
                    }
                }
            }
        }

        while let Ok(event) = execution_rx.try_recv() {
            self.handle_execution_event(event);
        }
        self.queue_rx = Some(execution_rx);
        info!("Snapshot feed closed, orchestrator stopped");
    }

    /// Hand `targets` to emergency closes. Returns those newly closed.
    fn force_close(&mut self, targets: &[Uuid], reason: TripReason) -> Vec<Uuid> {
        let mut closed = Vec::new();
        for id in targets {
            let Some(position) = self.store.get_mut(id) else {
                continue;
            };
            let newly_closed = !position.is_closed();
            self.trailing.close(position);
            self.stops_pending_restore.remove(id);

            if self.emergency_pending.insert(*id) {
                error!(position_id = %id, reason = ?reason, "Emergency close submitted");
                self.queue.submit(OrderIntent::emergency_close(position));
            }
            if newly_closed {
                closed.push(*id);
            }
        }
        closed
    }

    /// Resubmit emergency closes for positions whose last attempt failed.
    fn resubmit_stranded_closes(&mut self) {
        let stranded: Vec<Uuid> = self
            .store
            .positions()
            .filter(|p| p.is_closed() && !self.emergency_pending.contains(&p.id))
            .map(|p| p.id)
            .collect();
        for id in stranded {
            if let Some(position) = self.store.get(&id) {
                warn!(position_id = %id, "Retrying emergency close for position still open");
                self.queue.submit(OrderIntent::emergency_close(position));
                self.emergency_pending.insert(id);
            }
        }
    }

    /// Resubmit the current stop for positions whose stop order was
    /// abandoned, so an open position is never left without protection.
    fn restore_abandoned_stops(&mut self, report: &mut TickReport) {
        let pending: Vec<Uuid> = self.stops_pending_restore.drain().collect();
        for id in pending {
            let Some(position) = self.store.get(&id) else {
                continue;
            };
            if position.is_closed() {
                continue;
            }
            warn!(
                position_id = %id,
                stop = %position.trailing_stop,
                tier = ?position.tier,
                "Restoring abandoned protective stop"
            );
            self.queue.submit(OrderIntent::protective_stop(
                position,
                position.trailing_stop,
                position.tier.is_trailing(),
            ));
            report.stops_restored.push(id);
        }
    }

    fn advance_trailing_stops(&mut self, snapshot: &HealthSnapshot, report: &mut TickReport) {
        let mut intents = Vec::new();
        let mut events = Vec::new();

        for position in self.store.positions_mut() {
            if position.is_closed() {
                continue;
            }
            match self.trailing.advance(position, snapshot) {
                StopAdvance::Moved {
                    tier,
                    old_stop,
                    new_stop,
                    intent,
                } => {
                    report.stops_moved.push(position.id);
                    events.push(EngineEvent::StopUpdated {
                        position_id: position.id,
                        tier,
                        old_stop,
                        new_stop,
                    });
                    intents.push(intent);
                }
                StopAdvance::Skipped => report.trailing_skipped.push(position.id),
                StopAdvance::Held { .. } | StopAdvance::Closed => {}
            }

            if position.stop_breached(snapshot.price) {
                warn!(
                    position_id = %position.id,
                    price = %snapshot.price,
                    stop = %position.trailing_stop,
                    "Price through protective stop without a reported fill"
                );
                report.stops_breached.push(position.id);
            }
        }

        for event in events {
            self.emit(event);
        }
        for intent in intents {
            self.queue.submit(intent);
        }
    }

    fn drain_execution_events(&mut self) {
        let Some(mut rx) = self.queue_rx.take() else {
            return;
        };
        while let Ok(event) = rx.try_recv() {
            self.handle_execution_event(event);
        }
        self.queue_rx = Some(rx);
    }

    fn handle_execution_event(&mut self, event: EngineEvent) {
        let abandoned = match &event {
            EngineEvent::Abandoned {
                correlation_id,
                error,
                ..
            } => Some((*correlation_id, error.clone())),
            _ => None,
        };
        let Some((correlation_id, error)) = abandoned else {
            self.emit(event);
            return;
        };

        let position_id = correlation_id.position_id;
        match correlation_id.purpose {
            IntentPurpose::EmergencyClose => {
                self.emergency_pending.remove(&position_id);
            }
            IntentPurpose::Entry => self.discard_unfilled_entry(position_id),
            IntentPurpose::ProtectiveStop => {
                if self.store.get(&position_id).is_some_and(|p| !p.is_closed()) {
                    self.stops_pending_restore.insert(position_id);
                }
            }
        }
        self.emit(event);

        if error.is_critical() {
            error!(
                position_id = %position_id,
                error = %error,
                "Critical delivery failed, operator attention required"
            );
            self.mode = TradingMode::OperatorRequired;
            self.emit(EngineEvent::OperatorAlert { position_id, error });
        }
    }

    fn discard_unfilled_entry(&mut self, position_id: Uuid) {
        if let Some(position) = self.store.discard(&position_id) {
            warn!(
                position_id = %position_id,
                margin = %position.margin,
                "Entry order failed, position discarded"
            );
            self.queue.cancel(&CorrelationId::new(
                position_id,
                IntentPurpose::ProtectiveStop,
            ));
            self.emergency_pending.remove(&position_id);
            self.stops_pending_restore.remove(&position_id);
        }
    }

    /// Forget a position that is flat.
    fn retire(&mut self, position_id: Uuid) {
        for purpose in [IntentPurpose::Entry, IntentPurpose::ProtectiveStop] {
            self.queue.cancel(&CorrelationId::new(position_id, purpose));
        }
        self.emergency_pending.remove(&position_id);
        self.stops_pending_restore.remove(&position_id);
        info!(position_id = %position_id, "Position retired");
    }

    fn emit(&self, event: EngineEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("No receiver for engine event");
        }
    }
}
