//! Trading Engine
//!
//! Order delivery for leveraged positions: the venue adapter port and the
//! execution queue that retries, escalates and supersedes order intents.

pub mod execution_queue;
pub mod venue;

pub use execution_queue::{ExecutionConfig, ExecutionMetrics, ExecutionQueue, RetryRecord};
pub use venue::{PaperVenue, VenueAck, VenueAdapter, VenueError};
