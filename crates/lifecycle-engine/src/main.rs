//! Lifecycle Engine
//!
//! Paper-trading runner: drives the orchestrator from a random-walk feed
//! against an in-process venue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use lifecycle_engine::{
    EntryRequest, LifecycleOrchestrator, RandomWalkConfig, RandomWalkFeed, TradingMode,
};
use perp_core::types::{EngineEvent, IntentPurpose, PositionSide};
use perp_core::EngineSettings;
use risk_manager::{take_profit_levels, DEFAULT_TAKE_PROFIT_RATIOS};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trading_engine::PaperVenue;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(name = "lifecycle-engine")]
#[command(about = "Run the position lifecycle engine against a paper venue")]
struct Cli {
    /// TOML settings file; `ENGINE_*` environment variables are used otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Starting account equity
    #[arg(short, long, default_value = "10000")]
    equity: Decimal,

    /// Number of ticks to simulate
    #[arg(short, long, default_value = "500")]
    ticks: u64,

    /// Delay between ticks in milliseconds
    #[arg(long, default_value = "50")]
    tick_ms: u64,

    /// Leverage for simulated entries
    #[arg(short, long, default_value = "10")]
    leverage: Decimal,

    /// Fail the first N venue submissions with a transient error
    #[arg(long, default_value = "0")]
    fail_first: u32,

    /// Seed for a reproducible price walk
    #[arg(long)]
    seed: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "lifecycle_engine=info,trading_engine=info,risk_manager=info".into()
    });
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Lifecycle Engine");

    let settings = match &cli.config {
        Some(path) => EngineSettings::from_file(path)?,
        None => EngineSettings::from_env()?,
    };
    info!(
        instrument = %settings.instrument,
        risk_fraction = %settings.risk_fraction,
        max_leverage = %settings.max_leverage,
        "Settings loaded"
    );

    let venue = Arc::new(PaperVenue::failing_first(cli.fail_first));
    let mut engine = LifecycleOrchestrator::new(settings, cli.equity, venue);
    let mut events = engine
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("event receiver already taken"))?;

    let mut feed = RandomWalkFeed::new(RandomWalkConfig {
        seed: cli.seed,
        ..Default::default()
    });

    for tick in 0..cli.ticks {
        let price = feed.price();
        if engine.mode() == TradingMode::Normal && engine.store().is_empty() {
            let stop = (price * Decimal::new(99, 2)).round_dp(2);
            match engine.open_position(EntryRequest::new(
                PositionSide::Long,
                price,
                stop,
                cli.leverage,
            )) {
                Ok(id) => {
                    let ladder: Vec<String> = take_profit_levels(
                        price,
                        stop,
                        PositionSide::Long,
                        &DEFAULT_TAKE_PROFIT_RATIOS,
                    )
                    .iter()
                    .map(|level| format!("{}R@{}", level.ratio, level.price))
                    .collect();
                    info!(position_id = %id, tick, take_profit = ?ladder, "Opened simulated position");
                }
                Err(e) => warn!(error = %e, tick, "Entry refused"),
            }
        }

        let equity = engine.store().mark_to_market(price);
        let snapshot = feed.next_snapshot(equity);
        let report = match engine.on_tick(&snapshot) {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, tick, "Tick rejected");
                continue;
            }
        };

        // Paper fills: breached stops and confirmed emergency closes exit at the tick price.
        let mut exits = report.stops_breached.clone();
        while let Ok(event) = events.try_recv() {
            log_event(&event);
            if let EngineEvent::Confirmed { correlation_id, .. } = &event {
                if correlation_id.purpose == IntentPurpose::EmergencyClose {
                    exits.push(correlation_id.position_id);
                }
            }
        }
        for id in exits {
            let Some(quantity) = engine.position(&id).map(|p| p.quantity) else {
                continue;
            };
            match engine.apply_fill(id, quantity, snapshot.price) {
                Ok(outcome) => info!(
                    position_id = %id,
                    gross_pnl = %outcome.gross_pnl,
                    fees = %outcome.fees,
                    net_pnl = %outcome.realized_pnl,
                    "Paper exit filled"
                ),
                Err(e) => warn!(position_id = %id, error = %e, "Paper fill failed"),
            }
        }

        if engine.mode() == TradingMode::OperatorRequired {
            error!(tick, "Operator attention required, acknowledging for the paper run");
            engine.acknowledge_operator_alert();
        }

        tokio::time::sleep(Duration::from_millis(cli.tick_ms)).await;
    }

    let account = engine.store().account();
    info!(
        equity = %account.equity,
        used_margin = %account.used_margin,
        open_positions = engine.store().len(),
        delivery = ?engine.queue().metrics(),
        "Simulation finished"
    );
    Ok(())
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::Abandoned { .. }
        | EngineEvent::CircuitTripped { .. }
        | EngineEvent::OperatorAlert { .. } => match serde_json::to_string(event) {
            Ok(json) => warn!(event = %json, "Engine event"),
            Err(e) => error!(error = %e, "Failed to encode engine event"),
        },
        _ => match serde_json::to_string(event) {
            Ok(json) => info!(event = %json, "Engine event"),
            Err(e) => error!(error = %e, "Failed to encode engine event"),
        },
    }
}
