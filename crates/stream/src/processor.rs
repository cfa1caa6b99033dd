//! Stream processor: the per-message pipeline tying normalization output to
//! identity resolution and profile assembly.
//!
//! For each consumed interaction event: validate the source, resolve the
//! profile, fold the event into the golden record, publish the enriched
//! snapshot downstream, and emit segment-membership diffs. Failures route
//! to the DLQ without killing the batch; offsets commit exactly once per
//! batch after every task settles.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use cdp_bus::{topics, BusConsumer, BusMessage, DeadLetterQueue, EventPublisher};
use cdp_core::config::ProcessorConfig;
use cdp_core::error::{CdpError, CdpResult};
use cdp_core::logging::new_correlation_id;
use cdp_core::model::{CanonicalEvent, Profile};
use cdp_identity::resolver::IdentityResolver;
use cdp_profile::builder::ProfileBuilder;
use cdp_profile::segments::SegmentChange;
use cdp_profile::store::ProfileStore;

/// Sources the processor accepts; anything else goes to the DLQ.
pub const VALID_SOURCES: [&str; 5] = ["website", "app", "crm", "email", "whatsapp"];

const DLQ_REASON_MAX: usize = 120;

/// Record published to the warehouse staging topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingRecord {
    pub profile_id: Uuid,
    pub event: CanonicalEvent,
    pub profile_snapshot: Profile,
}

/// Consumes interaction events, enriches them, and forwards downstream.
pub struct StreamProcessor {
    config: ProcessorConfig,
    resolver: Arc<IdentityResolver>,
    builder: Arc<ProfileBuilder>,
    store: Arc<dyn ProfileStore>,
    consumer: Arc<dyn BusConsumer>,
    publisher: Arc<EventPublisher>,
    dlq: Arc<DeadLetterQueue>,
    semaphore: Arc<Semaphore>,
}

impl StreamProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ProcessorConfig,
        resolver: Arc<IdentityResolver>,
        builder: Arc<ProfileBuilder>,
        store: Arc<dyn ProfileStore>,
        consumer: Arc<dyn BusConsumer>,
        publisher: Arc<EventPublisher>,
        dlq: Arc<DeadLetterQueue>,
    ) -> CdpResult<Arc<Self>> {
        config.validate()?;
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        Ok(Arc::new(Self {
            config,
            resolver,
            builder,
            store,
            consumer,
            publisher,
            dlq,
            semaphore,
        }))
    }

    /// Consume until shutdown is signalled, then drain and flush.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> CdpResult<()> {
        info!(
            group = %self.config.consumer_group,
            batch_size = self.config.batch_size,
            max_concurrency = self.config.max_concurrency,
            "stream processor started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let processed = self.clone().run_once().await?;
            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.config.poll_timeout_ms)) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
        // Drain: the in-flight batch has already settled (run_once awaits
        // every task); flush pending publishes before closing.
        self.publisher.flush(Duration::from_secs(5)).await?;
        info!("stream processor shut down");
        Ok(())
    }

    /// Poll one batch, process every message concurrently (bounded by the
    /// semaphore), commit offsets exactly once. Returns messages handled.
    pub async fn run_once(self: Arc<Self>) -> CdpResult<usize> {
        let batch = self.consumer.poll_batch(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();

        let mut tasks = Vec::with_capacity(count);
        for msg in batch {
            let processor = self.clone();
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| CdpError::Internal(anyhow::anyhow!(e)))?;
            let span = info_span!(
                "process_message",
                correlation_id = %new_correlation_id(),
                partition = msg.partition,
                offset = msg.offset,
            );
            tasks.push(tokio::spawn(
                async move {
                    let _permit = permit;
                    processor.process_one(msg).await;
                }
                .instrument(span),
            ));
        }
        for task in tasks {
            // A panicked task must not poison the batch; the message will
            // be redelivered with the next uncommitted poll.
            if let Err(e) = task.await {
                warn!(error = %e, "message task panicked");
            }
        }

        self.consumer.commit().await?;
        debug!(batch = count, "offsets committed");
        Ok(count)
    }

    /// Handle one message end-to-end; all failures are routed to the DLQ.
    async fn process_one(&self, msg: BusMessage) {
        let start = std::time::Instant::now();
        let payload = match msg.json() {
            Ok(v) => v,
            Err(_) => {
                let original = msg
                    .payload
                    .as_deref()
                    .map(|b| Value::String(String::from_utf8_lossy(b).into_owned()))
                    .unwrap_or(Value::Null);
                self.send_to_dlq(original, "deserialization").await;
                return;
            }
        };

        let source = payload
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        if !VALID_SOURCES.contains(&source) {
            self.send_to_dlq(payload, "unknown_source").await;
            return;
        }

        let event: CanonicalEvent = match serde_json::from_value(payload.clone()) {
            Ok(e) => e,
            Err(_) => {
                self.send_to_dlq(payload, "deserialization").await;
                return;
            }
        };

        match self.enrich(&event).await {
            Ok(()) => {
                metrics::counter!("cdp_events_processed_total", "source" => source.to_string())
                    .increment(1);
            }
            Err(e) => {
                let reason: String = e.to_string().chars().take(DLQ_REASON_MAX).collect();
                warn!(error = %e, "event processing failed, routing to DLQ");
                self.send_to_dlq(payload, &reason).await;
            }
        }
        metrics::histogram!("cdp_processing_latency_seconds").record(start.elapsed().as_secs_f64());
    }

    /// Resolve, update, publish downstream, emit segment changes.
    async fn enrich(&self, event: &CanonicalEvent) -> CdpResult<()> {
        let profile_id = self.resolver.resolve(event).await?;
        let previous_segments = self
            .store
            .get(profile_id)
            .await?
            .map(|p| p.segments)
            .unwrap_or_default();

        let profile = self.builder.update_profile(profile_id, event).await?;

        let key = profile_id.to_string();
        let staging = StagingRecord {
            profile_id,
            event: event.clone(),
            profile_snapshot: profile.clone(),
        };
        self.publisher
            .publish_json(topics::BQ_STAGING, Some(&key), &staging)
            .await?;

        if let Some(change) =
            SegmentChange::diff(profile_id, &previous_segments, &profile.segments)
        {
            self.publisher
                .publish_json(topics::SEGMENT_CHANGES, Some(&key), &change)
                .await?;
        }
        Ok(())
    }

    async fn send_to_dlq(&self, original: Value, reason: &str) {
        // DLQ publish failure must not take the consume loop down; the
        // uncommitted offset redelivers the message.
        if let Err(e) = self.dlq.route(original, reason, 1).await {
            warn!(error = %e, reason = reason, "DLQ publish failed");
        }
    }
}
