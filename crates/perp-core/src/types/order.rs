//! Abstract order intents handed to the execution queue.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Position;

/// Side of the order (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Kind of order the venue adapter should place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit { price: Decimal },
    /// Stop order that replaces any resting stop for the same correlation id.
    Stop { trigger_price: Decimal },
}

impl OrderKind {
    pub fn is_market(&self) -> bool {
        matches!(self, Self::Market)
    }
}

/// Why an intent was raised for a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentPurpose {
    Entry,
    ProtectiveStop,
    EmergencyClose,
}

/// Key linking an intent to the position it serves.
///
/// A position has at most one live intent per purpose, so the execution
/// queue keys its retry records by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId {
    pub position_id: Uuid,
    pub purpose: IntentPurpose,
}

impl CorrelationId {
    pub fn new(position_id: Uuid, purpose: IntentPurpose) -> Self {
        Self {
            position_id,
            purpose,
        }
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let purpose = match self.purpose {
            IntentPurpose::Entry => "entry",
            IntentPurpose::ProtectiveStop => "stop",
            IntentPurpose::EmergencyClose => "emergency",
        };
        write!(f, "{}/{}", self.position_id, purpose)
    }
}

/// An abstract order for the venue adapter to translate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub id: Uuid,
    pub correlation_id: CorrelationId,
    pub instrument: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub kind: OrderKind,
    /// Non-delivery is unsafe; escalate rather than drop.
    pub critical: bool,
    pub created_at: DateTime<Utc>,
}

impl OrderIntent {
    pub fn new(
        correlation_id: CorrelationId,
        instrument: String,
        side: OrderSide,
        quantity: Decimal,
        kind: OrderKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id,
            instrument,
            side,
            quantity,
            kind,
            critical: false,
            created_at: Utc::now(),
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Limit order opening `position` at its entry price.
    pub fn entry(position: &Position) -> Self {
        Self::new(
            CorrelationId::new(position.id, IntentPurpose::Entry),
            position.instrument.clone(),
            position.side.entry_side(),
            position.quantity,
            OrderKind::Limit {
                price: position.entry_price,
            },
        )
    }

    /// Stop replace protecting `position` at `stop_price`.
    pub fn protective_stop(position: &Position, stop_price: Decimal, critical: bool) -> Self {
        let intent = Self::new(
            CorrelationId::new(position.id, IntentPurpose::ProtectiveStop),
            position.instrument.clone(),
            position.side.exit_side(),
            position.quantity,
            OrderKind::Stop {
                trigger_price: stop_price,
            },
        );
        if critical {
            intent.critical()
        } else {
            intent
        }
    }

    /// Market order flattening `position`. Always critical.
    pub fn emergency_close(position: &Position) -> Self {
        Self::new(
            CorrelationId::new(position.id, IntentPurpose::EmergencyClose),
            position.instrument.clone(),
            position.side.exit_side(),
            position.quantity,
            OrderKind::Market,
        )
        .critical()
    }

    /// Convert to a market order. Returns false if it already was one.
    pub fn escalate_to_market(&mut self) -> bool {
        if self.kind.is_market() {
            return false;
        }
        self.kind = OrderKind::Market;
        true
    }
}
