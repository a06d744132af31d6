//! Core domain types for the risk and execution lifecycle engine.

pub mod account;
pub mod circuit;
pub mod event;
pub mod health;
pub mod order;
pub mod position;

pub use account::*;
pub use circuit::*;
pub use event::*;
pub use health::*;
pub use order::*;
pub use position::*;
