//! Message-bus adapter: at-least-once publish/consume over a partitioned
//! topic space, with retrying publisher, manual offset commit, and a
//! dead-letter queue.
//!
//! The [`BusBackend`] / [`BusConsumer`] traits decouple pipeline stages from
//! the wire transport. [`memory::InMemoryBus`] is the default backend (local
//! runtime and tests); a Kafka backend is available behind the `kafka`
//! feature.

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use cdp_core::config::BusConfig;
use cdp_core::error::{CdpError, CdpResult};

pub mod topics {
    //! Canonical topic names. At-least-once, JSON values, string keys.

    pub const RAW_CLICKSTREAM: &str = "cdp.raw.clickstream";
    pub const RAW_MOBILE_APP: &str = "cdp.raw.mobile_app";
    pub const RAW_CRM: &str = "cdp.raw.crm";
    pub const RAW_WHATSAPP: &str = "cdp.raw.whatsapp";
    pub const RAW_EMAIL: &str = "cdp.raw.email";
    pub const PROCESSED_INTERACTIONS: &str = "cdp.processed.interactions";
    pub const BQ_STAGING: &str = "cdp.bigquery.staging";
    pub const SEGMENT_CHANGES: &str = "cdp.segment.changes";
    pub const DLQ: &str = "cdp.dlq";

    /// Topics that receive null-valued tombstones during subject erasure.
    pub const INTEGRATION_TOPICS: [&str; 3] =
        [PROCESSED_INTERACTIONS, BQ_STAGING, SEGMENT_CHANGES];
}

/// Per-attempt backoff never exceeds this many seconds, bounding total
/// publish latency at `max_retries` attempts.
pub const MAX_BACKOFF_S: f64 = 8.0;

/// A message as delivered to a consumer.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    /// `None` is a tombstone.
    pub payload: Option<Vec<u8>>,
}

impl BusMessage {
    /// Deserialize the payload as JSON.
    pub fn json(&self) -> CdpResult<Value> {
        let bytes = self
            .payload
            .as_deref()
            .ok_or_else(|| CdpError::Deserialization("empty payload".to_string()))?;
        serde_json::from_slice(bytes).map_err(|e| CdpError::Deserialization(e.to_string()))
    }
}

/// Raw transport: a single publish attempt, no retry.
#[async_trait]
pub trait BusBackend: Send + Sync {
    /// Publish one record. Equal keys map to the same partition and keep
    /// FIFO order for consumers in the same group. `None` payload publishes
    /// a tombstone.
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Option<&[u8]>,
    ) -> CdpResult<()>;

    /// Block until all in-flight publishes are delivered or the timeout
    /// elapses.
    async fn flush(&self, timeout: Duration) -> CdpResult<()>;
}

/// Consumer with manual offset commit. Auto-commit is disabled by contract:
/// offsets move only when [`BusConsumer::commit`] is called, so uncommitted
/// messages are redelivered (at-least-once).
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Deliver up to `max` messages from a single partition.
    async fn poll_batch(&self, max: usize) -> CdpResult<Vec<BusMessage>>;

    /// Commit offsets for everything delivered by the preceding poll.
    async fn commit(&self) -> CdpResult<()>;
}

/// Publisher with exponential-backoff retry and per-topic counters.
///
/// Attempt `n` sleeps `base * 2^(n-1)` seconds before retrying, capped at
/// [`MAX_BACKOFF_S`]. After the final failure a terminal
/// [`CdpError::PublishFailed`] is returned.
pub struct EventPublisher {
    backend: Arc<dyn BusBackend>,
    max_retries: u32,
    base_backoff: Duration,
}

impl EventPublisher {
    pub fn new(backend: Arc<dyn BusBackend>, config: &BusConfig) -> Self {
        Self {
            backend,
            max_retries: config.producer_max_retries.max(1),
            base_backoff: Duration::from_secs_f64(config.producer_backoff_s.max(0.0)),
        }
    }

    /// Publish raw bytes with retry.
    pub async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Option<&[u8]>,
    ) -> CdpResult<()> {
        let mut last_err = None;
        for attempt in 1..=self.max_retries {
            match self.backend.publish(topic, key, payload).await {
                Ok(()) => {
                    metrics::counter!("cdp_events_produced_total", "topic" => topic.to_string())
                        .increment(1);
                    return Ok(());
                }
                Err(e) => {
                    metrics::counter!("cdp_produce_errors_total", "topic" => topic.to_string())
                        .increment(1);
                    let backoff = self.backoff_for_attempt(attempt);
                    warn!(
                        topic = topic,
                        attempt = attempt,
                        max = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "publish failed, retrying"
                    );
                    last_err = Some(e);
                    if attempt < self.max_retries {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        warn!(topic = topic, error = ?last_err, "publish exhausted retries");
        Err(CdpError::PublishFailed {
            topic: topic.to_string(),
            attempts: self.max_retries,
        })
    }

    /// Serialize and publish a JSON value.
    pub async fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &T,
    ) -> CdpResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.publish(topic, key, Some(&bytes)).await
    }

    /// Publish a null-valued tombstone for the given key.
    pub async fn publish_tombstone(&self, topic: &str, key: &str) -> CdpResult<()> {
        self.publish(topic, Some(key), None).await
    }

    pub async fn flush(&self, timeout: Duration) -> CdpResult<()> {
        self.backend.flush(timeout).await
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.base_backoff.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(secs.min(MAX_BACKOFF_S))
    }
}

/// Payload written to the dead-letter topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub original: Value,
    pub error: String,
    pub first_failure_at: DateTime<Utc>,
    pub attempt_count: u32,
}

/// Routes unprocessable messages to the dead-letter topic.
pub struct DeadLetterQueue {
    publisher: Arc<EventPublisher>,
}

impl DeadLetterQueue {
    pub fn new(publisher: Arc<EventPublisher>) -> Self {
        Self { publisher }
    }

    /// Publish a DLQ entry. `original` is the verbatim payload (raw string
    /// when it was not valid JSON).
    pub async fn route(&self, original: Value, reason: &str, attempt_count: u32) -> CdpResult<()> {
        metrics::counter!("cdp_dlq_total", "reason" => reason.to_string()).increment(1);
        let entry = DlqEntry {
            original,
            error: reason.to_string(),
            first_failure_at: Utc::now(),
            attempt_count,
        };
        self.publisher.publish_json(topics::DLQ, None, &entry).await
    }
}
