//! Perp Guard Core Library
//!
//! Shared types, configuration, and error taxonomy for the risk and execution
//! lifecycle engine.

pub mod config;
pub mod error;
pub mod types;

pub use config::EngineSettings;
pub use error::{DeliveryError, Error, Result};
