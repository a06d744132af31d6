//! Integration tests for component interactions.
//!
//! These tests drive the sizer, trailing stops, circuit breaker, execution
//! queue and orchestrator together against the paper venue.

use std::sync::Arc;
use std::time::Duration;

use perp_core::types::{
    CircuitDecision, CorrelationId, EngineEvent, HealthSnapshot, IntentPurpose, OrderIntent,
    OrderKind, Position, PositionSide, ProtectionTier, TripReason, TripScope,
};
use perp_core::{DeliveryError, EngineSettings};
use rust_decimal::Decimal;
use tokio::sync::mpsc;

fn fast_settings() -> EngineSettings {
    EngineSettings {
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 8,
        ..Default::default()
    }
}

fn btc_long() -> lifecycle_engine::EntryRequest {
    lifecycle_engine::EntryRequest::new(
        PositionSide::Long,
        Decimal::new(95000, 0),
        Decimal::new(94000, 0),
        Decimal::new(10, 0),
    )
}

fn tick(price: i64) -> HealthSnapshot {
    HealthSnapshot::healthy(Decimal::new(price, 0)).with_atr(Decimal::new(1000, 0))
}

fn drain(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Sizing settings flow from the engine settings into the sizer.
#[test]
fn test_sizing_from_settings() {
    use risk_manager::{RiskSizer, SizingConfig, SizingRequest};

    let settings = EngineSettings::default();
    let sizer = RiskSizer::new(SizingConfig::from(&settings));

    let sizing = sizer
        .size(&SizingRequest {
            account_equity: Decimal::new(10000, 0),
            risk_fraction: settings.risk_fraction,
            entry_price: Decimal::new(95000, 0),
            stop_price: Decimal::new(94000, 0),
            leverage: Decimal::new(10, 0),
            side: PositionSide::Long,
        })
        .unwrap();

    assert_eq!(sizing.quantity, Decimal::new(5, 1));
    assert_eq!(sizing.notional, Decimal::new(47500, 0));
    assert_eq!(sizing.margin_required, Decimal::new(4750, 0));
    assert_eq!(sizing.usable_margin, Decimal::new(3800, 0));
    assert_eq!(sizing.liquidation_price, Decimal::new(87400, 0));
    assert_eq!(sizing.max_loss, Decimal::new(500, 0));
}

/// Trailing stops walk through the tiers and never loosen.
#[test]
fn test_trailing_stop_progression() {
    use risk_manager::{StopAdvance, TrailingStopConfig, TrailingStopController};

    let controller = TrailingStopController::new(TrailingStopConfig::default());
    let mut position = Position::new(
        "BTCUSDT".to_string(),
        PositionSide::Long,
        Decimal::new(95000, 0),
        Decimal::new(5, 1),
        Decimal::new(10, 0),
        Decimal::new(4750, 0),
        Decimal::new(94000, 0),
        None,
        Decimal::new(87400, 0),
    );

    match controller.advance(&mut position, &tick(96000)) {
        StopAdvance::Moved {
            tier,
            new_stop,
            intent,
            ..
        } => {
            assert_eq!(tier, ProtectionTier::Breakeven);
            assert_eq!(new_stop, Decimal::new(95000, 0));
            assert!(!intent.critical);
        }
        other => panic!("expected breakeven move, got {:?}", other),
    }

    match controller.advance(&mut position, &tick(98500)) {
        StopAdvance::Moved {
            tier,
            new_stop,
            intent,
            ..
        } => {
            assert_eq!(tier, ProtectionTier::ActiveTrail);
            assert_eq!(new_stop, Decimal::new(97000, 0));
            assert!(intent.critical);
        }
        other => panic!("expected trail move, got {:?}", other),
    }

    // Pullback: the looser trail is discarded and the tier is kept.
    assert_eq!(
        controller.advance(&mut position, &tick(97500)),
        StopAdvance::Held {
            tier: ProtectionTier::ActiveTrail
        }
    );
    assert_eq!(position.trailing_stop, Decimal::new(97000, 0));
    assert!(position.stop_breached(Decimal::new(96900, 0)));
}

/// Circuit breaker precedence: drawdown beats volatility.
#[test]
fn test_circuit_breaker_precedence() {
    use perp_core::types::AccountState;
    use risk_manager::{CircuitBreaker, CircuitBreakerConfig};

    let breaker = CircuitBreaker::new(CircuitBreakerConfig::from(&EngineSettings::default()));
    let account = AccountState::new(Decimal::new(10000, 0));
    let snapshot = tick(95000)
        .with_volatility(Decimal::new(12, 0))
        .with_drawdown(Decimal::new(60, 0));

    assert_eq!(
        breaker.evaluate(&snapshot, &account, std::iter::empty(), chrono::Utc::now()),
        CircuitDecision::ForceCloseAll {
            reason: TripReason::MaxDrawdownBreached,
            scope: TripScope::Account,
        }
    );
}

/// A critical stop that never lands escalates to market, then is abandoned.
#[tokio::test]
async fn test_critical_stop_escalation_end_to_end() {
    use trading_engine::{ExecutionConfig, ExecutionQueue, PaperVenue};

    let venue = Arc::new(PaperVenue::unreachable());
    let mut queue = ExecutionQueue::new(venue.clone(), ExecutionConfig::from(&fast_settings()));
    let mut rx = queue.take_event_receiver().unwrap();

    let position = Position::new(
        "BTCUSDT".to_string(),
        PositionSide::Long,
        Decimal::new(95000, 0),
        Decimal::new(5, 1),
        Decimal::new(10, 0),
        Decimal::new(4750, 0),
        Decimal::new(94000, 0),
        None,
        Decimal::new(87400, 0),
    );
    let intent = OrderIntent::protective_stop(&position, Decimal::new(96500, 0), true);
    let key = intent.correlation_id;
    queue.submit(intent);

    let mut events = Vec::new();
    let abandoned = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            let done = matches!(event, EngineEvent::Abandoned { .. });
            events.push(event);
            if done {
                break;
            }
        }
    })
    .await;
    assert!(abandoned.is_ok(), "queue never reached a terminal state");

    let escalations: Vec<bool> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Retrying { escalated, .. } => Some(*escalated),
            _ => None,
        })
        .collect();
    assert_eq!(escalations, vec![false, false, false, false, true]);

    match events.last() {
        Some(EngineEvent::Abandoned { error, .. }) => {
            assert!(error.is_critical());
            assert!(matches!(
                error,
                DeliveryError::DeliveryAbandoned { attempts: 6, .. }
            ));
        }
        other => panic!("expected abandonment, got {:?}", other),
    }
    let submitted = venue.submitted().await;
    assert_eq!(submitted.len(), 6);
    assert_eq!(submitted[5].kind, OrderKind::Market);
    assert!(!queue.is_live(&key));
}

/// Drawdown flattens the account; confirmed closes are filled and the
/// engine returns to normal trading.
#[tokio::test]
async fn test_drawdown_flatten_and_recover() {
    use lifecycle_engine::{LifecycleOrchestrator, TradingMode};
    use trading_engine::PaperVenue;

    let venue = Arc::new(PaperVenue::new());
    let mut engine = LifecycleOrchestrator::new(fast_settings(), Decimal::new(10000, 0), venue);
    let mut events = engine.take_event_receiver().unwrap();
    let first = engine.open_position(btc_long()).unwrap();
    let second = engine.open_position(btc_long()).unwrap();

    let stressed = tick(95000).with_drawdown(Decimal::new(55, 0));
    let report = engine.on_tick(&stressed).unwrap();
    assert_eq!(report.mode, TradingMode::Flattening);
    assert_eq!(report.force_closed.len(), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.on_tick(&stressed).unwrap();

    let confirmed: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::Confirmed { correlation_id, .. }
                if correlation_id.purpose == IntentPurpose::EmergencyClose =>
            {
                Some(correlation_id.position_id)
            }
            _ => None,
        })
        .collect();
    assert_eq!(confirmed.len(), 2);
    assert!(confirmed.contains(&first) && confirmed.contains(&second));

    for id in confirmed {
        let quantity = engine.position(&id).unwrap().quantity;
        let outcome = engine
            .apply_fill(id, quantity, Decimal::new(95000, 0))
            .unwrap();
        assert!(outcome.closed);
        assert!(!engine.is_emergency_pending(&id));
    }
    assert!(engine.store().is_empty());
    assert_eq!(engine.store().account().used_margin, Decimal::ZERO);
    // Flat exits still pay 14.25 in fees per position.
    assert_eq!(engine.store().account().equity, Decimal::new(99715, 1));

    let report = engine.on_tick(&tick(95000)).unwrap();
    assert_eq!(report.decision, CircuitDecision::Continue);
    assert_eq!(engine.mode(), TradingMode::Normal);
    assert!(engine.open_position(btc_long()).is_ok());
}

/// Open, trail into profit, get stopped out by a pullback.
#[tokio::test]
async fn test_position_lifecycle_to_stop_out() {
    use lifecycle_engine::LifecycleOrchestrator;
    use trading_engine::PaperVenue;

    let venue = Arc::new(PaperVenue::new());
    let mut engine =
        LifecycleOrchestrator::new(fast_settings(), Decimal::new(10000, 0), venue.clone());
    let mut events = engine.take_event_receiver().unwrap();
    let id = engine.open_position(btc_long()).unwrap();

    engine.on_tick(&tick(96000)).unwrap();
    engine.on_tick(&tick(98500)).unwrap();
    assert_eq!(
        engine.position(&id).unwrap().tier,
        ProtectionTier::ActiveTrail
    );

    // Let the queue deliver; only the latest stop per position reaches the venue.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let last_stop = venue
        .submitted()
        .await
        .into_iter()
        .filter(|i| i.correlation_id.purpose == IntentPurpose::ProtectiveStop)
        .last()
        .unwrap();
    assert_eq!(
        last_stop.kind,
        OrderKind::Stop {
            trigger_price: Decimal::new(97000, 0)
        }
    );
    assert!(last_stop.critical);

    let report = engine.on_tick(&tick(96900)).unwrap();
    assert!(report.stops_moved.is_empty());
    assert_eq!(report.stops_breached, vec![id]);

    let outcome = engine
        .apply_fill(id, Decimal::new(5, 1), Decimal::new(97000, 0))
        .unwrap();
    assert_eq!(outcome.gross_pnl, Decimal::new(1000, 0));
    assert_eq!(outcome.realized_pnl, Decimal::new(98555, 2));
    assert!(outcome.slippage.unwrap().acceptable);
    assert_eq!(engine.store().account().equity, Decimal::new(1098555, 2));
    assert!(!engine
        .queue()
        .is_live(&CorrelationId::new(id, IntentPurpose::ProtectiveStop)));

    let stops: Vec<Decimal> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::StopUpdated { new_stop, .. } => Some(new_stop),
            _ => None,
        })
        .collect();
    assert_eq!(stops, vec![Decimal::new(95000, 0), Decimal::new(97000, 0)]);
}

/// Settings load from a TOML file and feed every component.
#[test]
fn test_settings_from_file() {
    let dir = std::env::temp_dir().join(format!("perp-guard-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("engine.toml");
    std::fs::write(
        &path,
        "instrument = \"ETHUSDT\"\nrisk_fraction = \"0.02\"\nmax_retry_attempts = 3\n",
    )
    .unwrap();

    let settings = EngineSettings::from_file(&path).unwrap();
    assert_eq!(settings.instrument, "ETHUSDT");
    assert_eq!(settings.risk_fraction, Decimal::new(2, 2));
    assert_eq!(
        trading_engine::ExecutionConfig::from(&settings).max_attempts,
        3
    );

    std::fs::remove_dir_all(&dir).ok();
}
