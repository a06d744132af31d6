//! Engine event stream consumed by logging and telemetry.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CorrelationId, ProtectionTier, TripReason, TripScope};
use crate::DeliveryError;

/// Events emitted by the execution queue and the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Submitted {
        correlation_id: CorrelationId,
        intent_id: Uuid,
    },
    Retrying {
        correlation_id: CorrelationId,
        intent_id: Uuid,
        attempt: u32,
        delay_ms: u64,
        escalated: bool,
    },
    Abandoned {
        correlation_id: CorrelationId,
        intent_id: Uuid,
        error: DeliveryError,
    },
    Confirmed {
        correlation_id: CorrelationId,
        intent_id: Uuid,
        venue_order_id: String,
    },
    /// A live record was replaced by a newer intent for the same id.
    Superseded {
        correlation_id: CorrelationId,
        intent_id: Uuid,
    },
    StopUpdated {
        position_id: Uuid,
        tier: ProtectionTier,
        old_stop: Decimal,
        new_stop: Decimal,
    },
    /// `position_ids` lists the positions handed to an emergency close by
    /// this trip; empty for an entry halt.
    CircuitTripped {
        reason: TripReason,
        scope: TripScope,
        position_ids: Vec<Uuid>,
    },
    /// A critical close could not be delivered; the position may not be flat.
    OperatorAlert {
        position_id: Uuid,
        error: DeliveryError,
    },
}

impl EngineEvent {
    /// Correlation id for execution events.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::Submitted { correlation_id, .. }
            | Self::Retrying { correlation_id, .. }
            | Self::Abandoned { correlation_id, .. }
            | Self::Confirmed { correlation_id, .. }
            | Self::Superseded { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }
}
