//! Perp Guard: risk and execution lifecycle engine for leveraged perpetuals
//!
//! This is the root crate that provides benchmark and integration test access
//! to the internal modules. For actual functionality, use the individual
//! crates directly:
//!
//! - `perp-core`: Domain types, settings, shared errors
//! - `risk-manager`: Position sizing, trailing stops, circuit breaker
//! - `trading-engine`: Venue adapter port, execution queue with retries
//! - `lifecycle-engine`: Orchestrator, position store, paper runner

// Re-export for benchmarks
pub use lifecycle_engine as lifecycle;
pub use perp_core as core;
pub use risk_manager as risk;
pub use trading_engine as trading;
