//! Venue adapter port and a paper venue for simulation.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use perp_core::types::OrderIntent;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info};

/// Failure returned by a venue adapter, classified for the retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VenueError {
    /// Network error, timeout, rate limit. Safe to retry.
    #[error("Transient venue failure: {message}")]
    Transient { message: String },

    /// Rejected order, unknown instrument. Never retried.
    #[error("Venue rejected order: {message}")]
    Permanent { message: String },
}

impl VenueError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message } | Self::Permanent { message } => message,
        }
    }
}

/// Venue acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueAck {
    pub venue_order_id: String,
}

/// Port for translating order intents into venue orders.
///
/// A stop intent replaces any resting stop with the same correlation id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    async fn submit(&self, intent: &OrderIntent) -> Result<VenueAck, VenueError>;
}

/// In-process venue that accepts everything, optionally after scripted
/// transient failures or behind a gate.
#[derive(Debug, Default)]
pub struct PaperVenue {
    failures_remaining: AtomicU32,
    calls: AtomicU64,
    gate: Option<Semaphore>,
    submitted: Mutex<Vec<OrderIntent>>,
}

impl PaperVenue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `count` submissions with a transient error.
    pub fn failing_first(count: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(count),
            ..Default::default()
        }
    }

    /// Fail every submission with a transient error.
    pub fn unreachable() -> Self {
        Self::failing_first(u32::MAX)
    }

    /// Fail the next `count` submissions with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Hold every submission until `release` hands out a permit.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Let `count` held submissions through.
    pub fn release(&self, count: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(count);
        }
    }

    /// Submissions received so far, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Intents as they reached the venue, in order.
    pub async fn submitted(&self) -> Vec<OrderIntent> {
        self.submitted.lock().await.clone()
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    async fn submit(&self, intent: &OrderIntent) -> Result<VenueAck, VenueError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.submitted.lock().await.push(intent.clone());

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            debug!(intent_id = %intent.id, call, "[PAPER] Simulated transient failure");
            return Err(VenueError::transient("simulated venue timeout"));
        }

        info!(
            intent_id = %intent.id,
            correlation_id = %intent.correlation_id,
            side = ?intent.side,
            kind = ?intent.kind,
            quantity = %intent.quantity,
            "[PAPER] Order accepted"
        );
        Ok(VenueAck {
            venue_order_id: format!("paper-{}", call),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perp_core::types::{CorrelationId, IntentPurpose, OrderKind, OrderSide};
    use rust_decimal::Decimal;
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    fn intent() -> OrderIntent {
        OrderIntent::new(
            CorrelationId::new(Uuid::new_v4(), IntentPurpose::Entry),
            "BTCUSDT".to_string(),
            OrderSide::Buy,
            Decimal::ONE,
            OrderKind::Market,
        )
    }

    #[test]
    fn test_error_classification() {
        assert!(VenueError::transient("timeout").is_transient());
        assert!(!VenueError::permanent("unknown instrument").is_transient());
        assert_eq!(VenueError::permanent("bad").message(), "bad");
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let venue = PaperVenue::failing_first(2);
        let intent = intent();

        assert_err!(venue.submit(&intent).await);
        assert_err!(venue.submit(&intent).await);
        let ack = assert_ok!(venue.submit(&intent).await);

        assert_eq!(ack.venue_order_id, "paper-3");
        assert_eq!(venue.calls(), 3);
        assert_eq!(venue.submitted().await.len(), 3);
    }

    #[tokio::test]
    async fn test_fail_next_after_healthy_calls() {
        let venue = PaperVenue::new();
        let intent = intent();

        assert_ok!(venue.submit(&intent).await);
        venue.fail_next(1);
        assert_err!(venue.submit(&intent).await);
        assert_ok!(venue.submit(&intent).await);
        assert_eq!(venue.calls(), 3);
    }
}
