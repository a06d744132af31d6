//! Lifecycle Engine
//!
//! Ties the risk manager and the execution queue together: sizes new
//! positions, runs the per-tick circuit breaker and trailing stops, and turns
//! their outcomes into order intents.

pub mod error;
pub mod orchestrator;
pub mod simulation;
pub mod store;

pub use error::{EngineError, Result};
pub use orchestrator::{EntryRequest, LifecycleOrchestrator, TickReport, TradingMode};
pub use simulation::{RandomWalkConfig, RandomWalkFeed};
pub use store::{FillOutcome, PositionStore};
