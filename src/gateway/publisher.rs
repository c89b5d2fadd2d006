use crate::event::TelemetryEvent;
use crate::log::{EventLog, LogError, LogPosition, OutboundRecord, ProducerStamp};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("cannot encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("log rejected event: {0}")]
    Rejected(#[source] LogError),

    #[error("log unavailable after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: LogError,
    },
}

/// Exponential backoff for transient log failures.
///
/// Attempt `n` (zero-based) waits `initial_backoff * 2^n`, capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

struct ProducerState {
    producer_id: Uuid,
    next_sequence: u64,
}

/// Keyed, idempotent, retrying producer in front of an [`EventLog`].
///
/// Publishes go out one at a time. A retry of a record keeps its sequence
/// number, so a send whose acknowledgement was lost is not appended twice and
/// a later record can never overtake an earlier one for the same customer.
pub struct Publisher {
    log: Arc<dyn EventLog>,
    topic: String,
    retry: RetryPolicy,
    producer: Mutex<ProducerState>,
}

impl Publisher {
    pub fn new(log: Arc<dyn EventLog>, topic: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            log,
            topic: topic.into(),
            retry,
            producer: Mutex::new(ProducerState {
                producer_id: Uuid::new_v4(),
                next_sequence: 0,
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn publish(&self, event: &TelemetryEvent) -> Result<LogPosition, PublishError> {
        let value = event.to_log_payload()?;

        let mut producer = self.producer.lock().await;
        let stamp = ProducerStamp {
            producer_id: producer.producer_id,
            sequence: producer.next_sequence,
        };
        // Burn the sequence even if every attempt fails: an attempt whose ack was
        // lost may still have been appended under it.
        producer.next_sequence += 1;

        let record = OutboundRecord {
            key: event.customer_id.clone(),
            value,
            headers: vec![
                ("service".to_string(), event.service.clone()),
                ("env".to_string(), event.environment.clone()),
            ],
            producer: Some(stamp),
        };

        let mut attempt = 0;
        loop {
            match self.log.publish(&self.topic, record.clone()).await {
                Ok(position) => {
                    debug!(
                        partition = position.partition,
                        offset = position.offset,
                        request_id = %event.request_id,
                        "Published event"
                    );
                    return Ok(position);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(PublishError::Exhausted {
                        attempts: attempt + 1,
                        source: e,
                    });
                }
                Err(e) => return Err(PublishError::Rejected(e)),
            }
        }
    }
}
