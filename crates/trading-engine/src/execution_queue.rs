//! Order execution queue with retry, backoff and escalation.
//!
//! Each correlation id has at most one live retry record. Delivery runs on
//! spawned tasks; a retry waits on its own timer rather than polling. Every
//! record carries a generation number, and a venue response is only applied
//! if the record still has the generation the attempt started with.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use perp_core::types::{CorrelationId, EngineEvent, IntentPurpose, OrderIntent};
use perp_core::{DeliveryError, EngineSettings};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::venue::{VenueAck, VenueAdapter, VenueError};

/// Configuration for delivery retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Venue attempts before a record is abandoned (or escalated, if critical).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl From<&EngineSettings> for ExecutionConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            max_attempts: settings.max_retry_attempts,
            base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            max_delay: Duration::from_millis(settings.retry_max_delay_ms),
        }
    }
}

impl ExecutionConfig {
    /// Delay before the retry that follows the `failures`-th failure:
    /// `base * 2^(failures - 1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Delivery state for one correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub intent: OrderIntent,
    /// Failed venue attempts so far.
    pub attempt: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_failure: Option<String>,
    pub generation: u64,
    /// The market-order last resort has been used.
    pub escalated: bool,
}

impl RetryRecord {
    fn new(intent: OrderIntent, generation: u64) -> Self {
        Self {
            intent,
            attempt: 0,
            next_retry_at: None,
            last_failure: None,
            generation,
            escalated: false,
        }
    }
}

/// Metrics for order delivery.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionMetrics {
    pub submitted: u64,
    pub confirmed: u64,
    pub retries: u64,
    pub rejected: u64,
    pub abandoned: u64,
    pub superseded: u64,
    pub escalated: u64,
}

enum RecordState {
    /// A task is delivering (or about to deliver) the intent.
    InFlight,
    /// Waiting on a backoff timer.
    Scheduled(JoinHandle<()>),
}

struct LiveRecord {
    record: RetryRecord,
    state: RecordState,
}

impl LiveRecord {
    fn cancel_timer(self) -> RetryRecord {
        if let RecordState::Scheduled(handle) = self.state {
            handle.abort();
        }
        self.record
    }
}

enum NextStep {
    Done,
    RetryNow,
}

struct QueueInner {
    venue: Arc<dyn VenueAdapter>,
    config: ExecutionConfig,
    records: DashMap<CorrelationId, LiveRecord>,
    next_generation: AtomicU64,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    metrics: RwLock<ExecutionMetrics>,
}

/// Queue delivering order intents to a venue adapter.
///
/// `submit` must be called from within a Tokio runtime.
pub struct ExecutionQueue {
    inner: Arc<QueueInner>,
    event_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
}

impl ExecutionQueue {
    pub fn new(venue: Arc<dyn VenueAdapter>, config: ExecutionConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(QueueInner {
                venue,
                config,
                records: DashMap::new(),
                next_generation: AtomicU64::new(0),
                event_tx,
                metrics: RwLock::new(ExecutionMetrics::default()),
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the delivery event receiver (can only be called once).
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.event_rx.take()
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.inner.config
    }

    /// Enqueue `intent` for delivery.
    ///
    /// Any live record for the same correlation id is superseded: its timer
    /// is cancelled and a late venue response for it is discarded. An
    /// emergency close also cancels the position's non-critical records and
    /// its protective stop, critical or not.
    pub fn submit(&self, intent: OrderIntent) {
        let key = intent.correlation_id;
        let intent_id = intent.id;

        if key.purpose == IntentPurpose::EmergencyClose {
            self.inner.cancel_matching(|record| {
                record.intent.correlation_id.position_id == key.position_id
                    && (!record.intent.critical
                        || record.intent.correlation_id.purpose == IntentPurpose::ProtectiveStop)
            });
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            correlation_id = %key,
            intent_id = %intent_id,
            kind = ?intent.kind,
            critical = intent.critical,
            "Order intent submitted"
        );
        let previous = self.inner.records.insert(
            key,
            LiveRecord {
                record: RetryRecord::new(intent, generation),
                state: RecordState::InFlight,
            },
        );

        if let Some(previous) = previous {
            let superseded = previous.cancel_timer();
            debug!(
                correlation_id = %key,
                intent_id = %superseded.intent.id,
                generation = superseded.generation,
                "Superseded live record"
            );
            self.inner.update_metrics(|m| m.superseded += 1);
            self.inner.emit(EngineEvent::Superseded {
                correlation_id: key,
                intent_id: superseded.intent.id,
            });
        }

        self.inner.update_metrics(|m| m.submitted += 1);
        self.inner.emit(EngineEvent::Submitted {
            correlation_id: key,
            intent_id,
        });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.deliver(key, generation).await });
    }

    /// Drop the live record for `key`, cancelling its timer.
    pub fn cancel(&self, key: &CorrelationId) -> bool {
        match self.inner.records.remove(key) {
            Some((_, live)) => {
                let record = live.cancel_timer();
                info!(correlation_id = %key, attempt = record.attempt, "Cancelled live record");
                true
            }
            None => false,
        }
    }

    /// Cancel every non-critical record for `instrument` so a critical close
    /// is not queued behind stale retries. Returns how many were dropped.
    pub fn cancel_non_critical(&self, instrument: &str) -> usize {
        self.inner.cancel_matching(|record| {
            !record.intent.critical && record.intent.instrument == instrument
        })
    }

    /// Cancel every live record.
    pub fn shutdown(&self) {
        let cancelled = self.inner.cancel_matching(|_| true);
        if cancelled > 0 {
            info!(cancelled, "Execution queue shut down");
        }
    }

    /// Snapshot of the live record for `key`.
    pub fn live_record(&self, key: &CorrelationId) -> Option<RetryRecord> {
        self.inner.records.get(key).map(|live| live.record.clone())
    }

    pub fn is_live(&self, key: &CorrelationId) -> bool {
        self.inner.records.contains_key(key)
    }

    pub fn live_count(&self) -> usize {
        self.inner.records.len()
    }

    pub fn metrics(&self) -> ExecutionMetrics {
        self.inner
            .metrics
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

impl Drop for ExecutionQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl QueueInner {
    /// Attempt delivery for `key` as long as its record still has
    /// `generation`.
    async fn deliver(self: Arc<Self>, key: CorrelationId, generation: u64) {
        loop {
            let intent = match self.records.get(&key) {
                Some(live) if live.record.generation == generation => live.record.intent.clone(),
                _ => {
                    debug!(correlation_id = %key, generation, "Record gone before delivery");
                    return;
                }
            };

            let result = self.venue.submit(&intent).await;

            match self.settle(key, generation, result) {
                NextStep::Done => return,
                NextStep::RetryNow => continue,
            }
        }
    }

    fn settle(
        self: &Arc<Self>,
        key: CorrelationId,
        generation: u64,
        result: Result<VenueAck, VenueError>,
    ) -> NextStep {
        let mut live = match self.records.get_mut(&key) {
            Some(live) if live.record.generation == generation => live,
            _ => {
                debug!(
                    correlation_id = %key,
                    generation,
                    "Discarding venue response for superseded record"
                );
                return NextStep::Done;
            }
        };
        let intent_id = live.record.intent.id;
        let critical = live.record.intent.critical;

        match result {
            Ok(ack) => {
                drop(live);
                self.remove_generation(&key, generation);
                info!(
                    correlation_id = %key,
                    intent_id = %intent_id,
                    venue_order_id = %ack.venue_order_id,
                    "Order confirmed"
                );
                self.update_metrics(|m| m.confirmed += 1);
                self.emit(EngineEvent::Confirmed {
                    correlation_id: key,
                    intent_id,
                    venue_order_id: ack.venue_order_id,
                });
                NextStep::Done
            }
            Err(VenueError::Permanent { message }) => {
                drop(live);
                self.remove_generation(&key, generation);
                error!(
                    correlation_id = %key,
                    intent_id = %intent_id,
                    critical,
                    reason = %message,
                    "Order rejected by venue"
                );
                self.update_metrics(|m| m.rejected += 1);
                self.emit(EngineEvent::Abandoned {
                    correlation_id: key,
                    intent_id,
                    error: DeliveryError::OrderRejected {
                        correlation_id: key,
                        reason: message,
                        critical,
                    },
                });
                NextStep::Done
            }
            Err(VenueError::Transient { message }) => {
                let record = &mut live.record;
                record.attempt += 1;
                record.last_failure = Some(message.clone());
                let attempt = record.attempt;

                if record.escalated || (attempt >= self.config.max_attempts && !critical) {
                    drop(live);
                    self.abandon(key, generation, intent_id, attempt, message, critical);
                    return NextStep::Done;
                }

                if attempt >= self.config.max_attempts {
                    let converted = record.intent.escalate_to_market();
                    record.escalated = true;
                    record.next_retry_at = None;
                    warn!(
                        correlation_id = %key,
                        intent_id = %intent_id,
                        attempt,
                        converted_to_market = converted,
                        "Retries exhausted for critical order, last resort attempt"
                    );
                    drop(live);
                    self.update_metrics(|m| {
                        m.retries += 1;
                        m.escalated += 1;
                    });
                    self.emit(EngineEvent::Retrying {
                        correlation_id: key,
                        intent_id,
                        attempt,
                        delay_ms: 0,
                        escalated: true,
                    });
                    return NextStep::RetryNow;
                }

                let delay = self.config.backoff_delay(attempt);
                record.next_retry_at = chrono::Duration::from_std(delay)
                    .ok()
                    .map(|delay| Utc::now() + delay);
                warn!(
                    correlation_id = %key,
                    intent_id = %intent_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Transient delivery failure, retry scheduled"
                );

                let inner = Arc::clone(self);
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.deliver(key, generation).await;
                });
                live.state = RecordState::Scheduled(handle);
                drop(live);

                self.update_metrics(|m| m.retries += 1);
                self.emit(EngineEvent::Retrying {
                    correlation_id: key,
                    intent_id,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    escalated: false,
                });
                NextStep::Done
            }
        }
    }

    fn abandon(
        &self,
        key: CorrelationId,
        generation: u64,
        intent_id: Uuid,
        attempts: u32,
        last_failure: String,
        critical: bool,
    ) {
        self.remove_generation(&key, generation);
        if critical {
            error!(
                correlation_id = %key,
                intent_id = %intent_id,
                attempts,
                last_failure = %last_failure,
                "Critical order delivery abandoned"
            );
        } else {
            warn!(
                correlation_id = %key,
                intent_id = %intent_id,
                attempts,
                last_failure = %last_failure,
                "Order delivery abandoned"
            );
        }
        self.update_metrics(|m| m.abandoned += 1);
        self.emit(EngineEvent::Abandoned {
            correlation_id: key,
            intent_id,
            error: DeliveryError::DeliveryAbandoned {
                correlation_id: key,
                attempts,
                last_failure,
                critical,
            },
        });
    }

    fn remove_generation(&self, key: &CorrelationId, generation: u64) {
        self.records
            .remove_if(key, |_, live| live.record.generation == generation);
    }

    fn cancel_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&RetryRecord) -> bool,
    {
        let keys: Vec<CorrelationId> = self
            .records
            .iter()
            .filter(|entry| predicate(&entry.value().record))
            .map(|entry| *entry.key())
            .collect();

        let mut cancelled = 0;
        for key in keys {
            if let Some((_, live)) = self.records.remove_if(&key, |_, live| predicate(&live.record)) {
                let record = live.cancel_timer();
                info!(
                    correlation_id = %key,
                    intent_id = %record.intent.id,
                    "Cancelled live record"
                );
                cancelled += 1;
            }
        }
        cancelled
    }

    fn update_metrics<F: FnOnce(&mut ExecutionMetrics)>(&self, update: F) {
        if let Ok(mut metrics) = self.metrics.write() {
            update(&mut metrics);
        }
    }

    fn emit(&self, event: EngineEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("No receiver for execution event");
        }
    }
}
