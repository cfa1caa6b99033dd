//! Source connectors: one pump, source-specific extraction injected.
//!
//! Each connector polls a raw topic, validates and normalizes the payload
//! through a [`SourceExtractor`], and republishes the canonical event to
//! `cdp.processed.interactions` keyed for partition-level ordering
//! (session for clickstream, device for mobile, salesforce id for CRM).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use cdp_bus::{topics, BusConsumer, DeadLetterQueue, EventPublisher};
use cdp_core::error::{CdpError, CdpResult};
use cdp_core::model::{CanonicalEvent, EventSource, Identifier, IdentifierType};

use crate::normalizer::FormatNormalizer;

/// Source-specific extraction behind a common interface.
pub trait SourceExtractor: Send + Sync {
    fn source(&self) -> EventSource;

    /// Raw topic this extractor consumes.
    fn raw_topic(&self) -> &'static str;

    /// Validate and convert one raw payload. `CdpError::Validation` means
    /// the message is skipped with a warning; other errors route to the DLQ.
    fn extract(&self, raw: &Value, normalizer: &FormatNormalizer) -> CdpResult<CanonicalEvent>;

    /// Partition key for the processed topic, preserving per-subject FIFO.
    fn partition_key(&self, event: &CanonicalEvent) -> Option<String>;
}

// ─── Clickstream ────────────────────────────────────────────────────────

pub struct ClickstreamExtractor;

impl SourceExtractor for ClickstreamExtractor {
    fn source(&self) -> EventSource {
        EventSource::Website
    }

    fn raw_topic(&self) -> &'static str {
        topics::RAW_CLICKSTREAM
    }

    fn extract(&self, raw: &Value, normalizer: &FormatNormalizer) -> CdpResult<CanonicalEvent> {
        let session_id = raw
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CdpError::Validation("clickstream event missing session_id".into()))?;
        let page_url = raw
            .get("page_url")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CdpError::Validation("clickstream event missing page_url".into()))?;

        let mut event = normalizer.normalize_json(raw, EventSource::Website);
        event.normalized_data.insert("session_id".into(), json!(session_id));
        event.normalized_data.insert("page_url".into(), json!(page_url));
        if let Some(utm) = raw.get("utm_params") {
            event.normalized_data.insert("utm_params".into(), utm.clone());
        }
        if let Some(referrer) = raw.get("referrer") {
            event.normalized_data.insert("referrer".into(), referrer.clone());
        }
        if !event.has_identifier_type(IdentifierType::SessionId) {
            event
                .identifiers
                .push(Identifier::new(IdentifierType::SessionId, session_id)?);
        }
        Ok(event)
    }

    fn partition_key(&self, event: &CanonicalEvent) -> Option<String> {
        event
            .identifiers
            .iter()
            .find(|i| i.id_type == IdentifierType::SessionId)
            .map(|i| i.value.clone())
    }
}

// ─── Mobile app ─────────────────────────────────────────────────────────

const MOBILE_EVENT_TYPES: [&str; 8] = [
    "app_opened",
    "lesson_completed",
    "quiz_taken",
    "push_clicked",
    "course_downloaded",
    "study_session_started",
    "study_session_ended",
    "notification_received",
];

pub struct MobileAppExtractor;

impl SourceExtractor for MobileAppExtractor {
    fn source(&self) -> EventSource {
        EventSource::App
    }

    fn raw_topic(&self) -> &'static str {
        topics::RAW_MOBILE_APP
    }

    fn extract(&self, raw: &Value, normalizer: &FormatNormalizer) -> CdpResult<CanonicalEvent> {
        let event_type = raw
            .get("event_type")
            .and_then(Value::as_str)
            .ok_or_else(|| CdpError::Validation("mobile event missing event_type".into()))?;
        if !MOBILE_EVENT_TYPES.contains(&event_type) {
            return Err(CdpError::Validation(format!(
                "unknown mobile event_type: {event_type}"
            )));
        }
        let device_id = raw
            .get("device_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CdpError::Validation("mobile event missing device_id".into()))?;

        let mut event = normalizer.normalize_json(raw, EventSource::App);
        event.event_type = format!("mobile.{event_type}");

        // Device identifiers feed cross-device identity resolution.
        if !event.has_identifier_type(IdentifierType::DeviceId) {
            event
                .identifiers
                .push(Identifier::new(IdentifierType::DeviceId, device_id)?);
        }
        if let Some(ad_id) = raw.get("advertising_id").and_then(Value::as_str) {
            if !ad_id.is_empty() {
                event
                    .identifiers
                    .push(Identifier::new(IdentifierType::DeviceId, ad_id)?);
            }
        }

        let os = format!(
            "{} {}",
            raw.get("os_name").and_then(Value::as_str).unwrap_or(""),
            raw.get("os_version").and_then(Value::as_str).unwrap_or("")
        )
        .trim()
        .to_string();
        event.normalized_data.insert("os".into(), json!(os));
        if let Some(version) = raw.get("app_version") {
            event.normalized_data.insert("app_version".into(), version.clone());
        }
        if let Some(props) = raw.get("properties").and_then(Value::as_object) {
            for (k, v) in props {
                event.normalized_data.insert(k.clone(), v.clone());
            }
        }
        Ok(event)
    }

    fn partition_key(&self, event: &CanonicalEvent) -> Option<String> {
        event
            .identifiers
            .iter()
            .find(|i| i.id_type == IdentifierType::DeviceId)
            .map(|i| i.value.clone())
    }
}

// ─── CRM change feed ────────────────────────────────────────────────────

/// Maps CRM-native field names to unified names. Runtime configuration, not
/// a compile-time schema: deployments override per CRM org.
pub fn default_crm_field_map() -> HashMap<String, String> {
    [
        ("Id", "salesforce_id"),
        ("FirstName", "first_name"),
        ("LastName", "last_name"),
        ("Email", "email"),
        ("Phone", "phone"),
        ("LeadStatus", "enrollment_status"),
        ("Program_of_Interest__c", "program_interest"),
        ("CreatedDate", "sf_created_at"),
        ("LastModifiedDate", "sf_modified_at"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// CRM daily API call budget (Enterprise Edition default).
pub const CRM_DAILY_API_LIMIT: u64 = 100_000;

const CRM_API_WINDOW: Duration = Duration::from_secs(86_400);

pub struct CrmExtractor {
    field_map: HashMap<String, String>,
    daily_api_limit: u64,
    api_calls: AtomicU64,
    window_started: Mutex<Instant>,
}

impl CrmExtractor {
    pub fn new(field_map: HashMap<String, String>) -> Self {
        Self {
            field_map,
            daily_api_limit: CRM_DAILY_API_LIMIT,
            api_calls: AtomicU64::new(0),
            window_started: Mutex::new(Instant::now()),
        }
    }

    pub fn with_daily_limit(mut self, daily_api_limit: u64) -> Self {
        self.daily_api_limit = daily_api_limit.max(1);
        self
    }

    /// Start a fresh quota window with a zeroed call counter.
    pub fn reset_window(&self) {
        *self.window_started.lock() = Instant::now();
        self.api_calls.store(0, Ordering::Relaxed);
    }

    /// Spend one API call from the daily budget. Trips once the budget is
    /// exhausted, until the window rolls over.
    fn check_rate_limit(&self) -> CdpResult<()> {
        {
            let mut started = self.window_started.lock();
            if started.elapsed() >= CRM_API_WINDOW {
                *started = Instant::now();
                self.api_calls.store(0, Ordering::Relaxed);
            }
        }
        let used = self.api_calls.fetch_add(1, Ordering::Relaxed);
        if used >= self.daily_api_limit {
            metrics::counter!("cdp_rate_limit_trips_total", "source" => "crm").increment(1);
            return Err(CdpError::RateLimit(format!(
                "crm daily API limit reached ({})",
                self.daily_api_limit
            )));
        }
        Ok(())
    }

    /// Translate CRM field names to unified names; unmapped fields are kept
    /// under an `sf_` namespace prefix.
    fn map_fields(&self, record: &Map<String, Value>) -> Map<String, Value> {
        let mut mapped = Map::new();
        for (crm_key, cdp_key) in &self.field_map {
            if let Some(value) = record.get(crm_key) {
                mapped.insert(cdp_key.clone(), value.clone());
            }
        }
        for (key, value) in record {
            if !self.field_map.contains_key(key) && key != "attributes" {
                mapped.insert(format!("sf_{key}"), value.clone());
            }
        }
        mapped
    }

    /// Normalize one bulk-CSV row via the schema map.
    pub fn csv_row(&self, row: &Map<String, Value>, normalizer: &FormatNormalizer) -> CanonicalEvent {
        let mut event = normalizer.normalize_csv_row(row, &self.field_map);
        event.event_type = "crm.lead.csv_import".to_string();
        event
    }
}

impl Default for CrmExtractor {
    fn default() -> Self {
        Self::new(default_crm_field_map())
    }
}

impl SourceExtractor for CrmExtractor {
    fn source(&self) -> EventSource {
        EventSource::Crm
    }

    fn raw_topic(&self) -> &'static str {
        topics::RAW_CRM
    }

    fn extract(&self, raw: &Value, normalizer: &FormatNormalizer) -> CdpResult<CanonicalEvent> {
        self.check_rate_limit()?;
        let record = raw
            .as_object()
            .ok_or_else(|| CdpError::Validation("crm payload is not an object".into()))?;
        let mapped = self.map_fields(record);

        let mut event = normalizer.normalize_json(&Value::Object(mapped.clone()), EventSource::Crm);
        event.event_type = raw
            .get("event_type")
            .and_then(Value::as_str)
            .unwrap_or("crm.lead.changed")
            .to_string();
        event.raw_data = raw.clone();
        event.student_id = mapped
            .get("salesforce_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        event.timestamp = mapped
            .get("sf_modified_at")
            .map(crate::normalizer::parse_timestamp)
            .unwrap_or_else(Utc::now);
        Ok(event)
    }

    fn partition_key(&self, event: &CanonicalEvent) -> Option<String> {
        event
            .identifiers
            .iter()
            .find(|i| i.id_type == IdentifierType::SalesforceId)
            .map(|i| i.value.clone())
    }
}

// ─── Connector pump ─────────────────────────────────────────────────────

/// Polls a raw topic, extracts canonical events, republishes downstream.
pub struct Connector {
    extractor: Arc<dyn SourceExtractor>,
    consumer: Arc<dyn BusConsumer>,
    publisher: Arc<EventPublisher>,
    dlq: Arc<DeadLetterQueue>,
    normalizer: FormatNormalizer,
}

impl Connector {
    pub fn new(
        extractor: Arc<dyn SourceExtractor>,
        consumer: Arc<dyn BusConsumer>,
        publisher: Arc<EventPublisher>,
        dlq: Arc<DeadLetterQueue>,
    ) -> Self {
        info!(
            source = %extractor.source(),
            topic = extractor.raw_topic(),
            "connector initialized"
        );
        Self {
            extractor,
            consumer,
            publisher,
            dlq,
            normalizer: FormatNormalizer::new(),
        }
    }

    /// Poll one batch, process every message, commit once. Returns the
    /// number of canonical events published.
    pub async fn run_once(&self, max: usize) -> CdpResult<usize> {
        let batch = self.consumer.poll_batch(max).await?;
        if batch.is_empty() {
            return Ok(0);
        }
        let mut published = 0usize;
        for msg in &batch {
            let raw = match msg.json() {
                Ok(v) => v,
                Err(_) => {
                    let original = msg
                        .payload
                        .as_deref()
                        .map(|b| Value::String(String::from_utf8_lossy(b).into_owned()))
                        .unwrap_or(Value::Null);
                    self.dlq.route(original, "deserialization", 1).await?;
                    continue;
                }
            };
            match self.extractor.extract(&raw, &self.normalizer) {
                Ok(event) => {
                    let key = self.extractor.partition_key(&event);
                    self.publisher
                        .publish_json(topics::PROCESSED_INTERACTIONS, key.as_deref(), &event)
                        .await?;
                    metrics::counter!(
                        "cdp_connector_events_total",
                        "source" => self.extractor.source().as_str()
                    )
                    .increment(1);
                    published += 1;
                }
                Err(CdpError::Validation(reason)) => {
                    warn!(
                        offset = msg.offset,
                        partition = msg.partition,
                        source = %self.extractor.source(),
                        reason = %reason,
                        "invalid raw event, skipping"
                    );
                }
                Err(e @ CdpError::RateLimit(_)) => {
                    // Quota exhausted: leave the batch uncommitted so it
                    // replays once the caller resumes after the window
                    // resets. Not a DLQ case.
                    warn!(
                        source = %self.extractor.source(),
                        error = %e,
                        "source rate limited, pausing batch"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let reason: String = e.to_string().chars().take(120).collect();
                    self.dlq.route(raw, &reason, 1).await?;
                }
            }
        }
        self.consumer.commit().await?;
        debug!(
            source = %self.extractor.source(),
            batch = batch.len(),
            published = published,
            "connector batch committed"
        );
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_bus::memory::InMemoryBus;
    use cdp_bus::BusBackend;
    use cdp_core::config::BusConfig;

    fn setup(extractor: Arc<dyn SourceExtractor>) -> (Arc<InMemoryBus>, Connector) {
        let bus = InMemoryBus::new();
        let publisher = Arc::new(EventPublisher::new(bus.clone(), &BusConfig::default()));
        let dlq = Arc::new(DeadLetterQueue::new(publisher.clone()));
        let consumer = Arc::new(bus.consumer(extractor.raw_topic(), "test-cg"));
        let connector = Connector::new(extractor, consumer, publisher, dlq);
        (bus, connector)
    }

    #[tokio::test]
    async fn test_clickstream_round_trip() {
        let (bus, connector) = setup(Arc::new(ClickstreamExtractor));
        let raw = json!({
            "session_id": "sess-1",
            "page_url": "https://uni.example/programs",
            "event_type": "page_view",
            "user_id": "u-1"
        });
        bus.publish(
            topics::RAW_CLICKSTREAM,
            Some("sess-1"),
            Some(&serde_json::to_vec(&raw).unwrap()),
        )
        .await
        .unwrap();

        let published = connector.run_once(10).await.unwrap();
        assert_eq!(published, 1);

        let processed = bus.drain_payloads(topics::PROCESSED_INTERACTIONS);
        assert_eq!(processed.len(), 1);
        let event: CanonicalEvent =
            serde_json::from_slice(processed[0].as_ref().unwrap()).unwrap();
        assert_eq!(event.source, EventSource::Website);
        assert_eq!(event.normalized_data["page_url"], json!("https://uni.example/programs"));
        assert_eq!(event.student_id.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn test_invalid_clickstream_is_skipped_not_dlq() {
        let (bus, connector) = setup(Arc::new(ClickstreamExtractor));
        let raw = json!({"page_url": "https://x", "event_type": "page_view"});
        bus.publish(
            topics::RAW_CLICKSTREAM,
            None,
            Some(&serde_json::to_vec(&raw).unwrap()),
        )
        .await
        .unwrap();

        let published = connector.run_once(10).await.unwrap();
        assert_eq!(published, 0);
        assert_eq!(bus.topic_len(topics::DLQ), 0);
        assert_eq!(bus.topic_len(topics::PROCESSED_INTERACTIONS), 0);
    }

    #[tokio::test]
    async fn test_garbage_payload_routes_to_dlq() {
        let (bus, connector) = setup(Arc::new(ClickstreamExtractor));
        bus.publish(topics::RAW_CLICKSTREAM, None, Some(b"not json"))
            .await
            .unwrap();

        connector.run_once(10).await.unwrap();
        let dlq = bus.drain_payloads(topics::DLQ);
        assert_eq!(dlq.len(), 1);
        let entry: Value = serde_json::from_slice(dlq[0].as_ref().unwrap()).unwrap();
        assert_eq!(entry["error"], json!("deserialization"));
    }

    #[tokio::test]
    async fn test_mobile_event_type_prefix_and_device_identifier() {
        let (bus, connector) = setup(Arc::new(MobileAppExtractor));
        let raw = json!({
            "event_type": "lesson_completed",
            "device_id": "D1",
            "advertising_id": "AD1",
            "user_id": "u-2",
            "os_name": "iOS",
            "os_version": "17.0"
        });
        bus.publish(
            topics::RAW_MOBILE_APP,
            Some("D1"),
            Some(&serde_json::to_vec(&raw).unwrap()),
        )
        .await
        .unwrap();

        connector.run_once(10).await.unwrap();
        let processed = bus.drain_payloads(topics::PROCESSED_INTERACTIONS);
        let event: CanonicalEvent =
            serde_json::from_slice(processed[0].as_ref().unwrap()).unwrap();
        assert_eq!(event.event_type, "mobile.lesson_completed");
        let devices: Vec<_> = event
            .identifiers
            .iter()
            .filter(|i| i.id_type == IdentifierType::DeviceId)
            .map(|i| i.value.as_str())
            .collect();
        assert_eq!(devices, vec!["D1", "AD1"]);
        assert_eq!(event.normalized_data["os"], json!("iOS 17.0"));
    }

    #[tokio::test]
    async fn test_unknown_mobile_event_type_skipped() {
        let (bus, connector) = setup(Arc::new(MobileAppExtractor));
        let raw = json!({"event_type": "selfie_taken", "device_id": "D1"});
        bus.publish(
            topics::RAW_MOBILE_APP,
            None,
            Some(&serde_json::to_vec(&raw).unwrap()),
        )
        .await
        .unwrap();
        assert_eq!(connector.run_once(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_crm_field_mapping() {
        let (bus, connector) = setup(Arc::new(CrmExtractor::default()));
        let raw = json!({
            "Id": "003XX01",
            "FirstName": "Alice",
            "LastName": "Brown",
            "Email": "alice@uni.edu",
            "Custom_Field__c": "kept",
            "LastModifiedDate": "2025-01-02T10:00:00 CET"
        });
        bus.publish(
            topics::RAW_CRM,
            Some("003XX01"),
            Some(&serde_json::to_vec(&raw).unwrap()),
        )
        .await
        .unwrap();

        connector.run_once(10).await.unwrap();
        let processed = bus.drain_payloads(topics::PROCESSED_INTERACTIONS);
        let event: CanonicalEvent =
            serde_json::from_slice(processed[0].as_ref().unwrap()).unwrap();
        assert_eq!(event.source, EventSource::Crm);
        assert_eq!(event.event_type, "crm.lead.changed");
        assert_eq!(event.normalized_data["salesforce_id"], json!("003XX01"));
        assert_eq!(event.normalized_data["sf_Custom_Field__c"], json!("kept"));
        assert_eq!(event.personal_info.name.as_deref(), Some("Alice Brown"));
        assert_eq!(event.timestamp.to_rfc3339(), "2025-01-02T09:00:00+00:00");
        assert!(event
            .identifiers
            .iter()
            .any(|i| i.id_type == IdentifierType::SalesforceId && i.value == "003XX01"));
    }

    #[tokio::test]
    async fn test_crm_rate_limit_pauses_batch_without_dlq() {
        let extractor = Arc::new(CrmExtractor::default().with_daily_limit(2));
        let (bus, connector) = setup(extractor.clone());

        let publish_lead = |bus: Arc<InMemoryBus>, id: String| async move {
            let raw = json!({"Id": id.clone(), "Email": format!("{id}@uni.edu")});
            bus.publish(
                topics::RAW_CRM,
                Some(&id),
                Some(&serde_json::to_vec(&raw).unwrap()),
            )
            .await
            .unwrap();
        };

        // Two calls spend the budget.
        publish_lead(bus.clone(), "003AA".to_string()).await;
        publish_lead(bus.clone(), "003AA".to_string()).await;
        assert_eq!(connector.run_once(10).await.unwrap(), 2);

        // The next record trips the guard: the error surfaces, nothing is
        // dead-lettered, and the batch stays uncommitted.
        publish_lead(bus.clone(), "003AA".to_string()).await;
        let err = connector.run_once(10).await.expect_err("budget spent");
        assert!(matches!(err, CdpError::RateLimit(_)));
        assert_eq!(bus.topic_len(topics::DLQ), 0);
        assert_eq!(bus.topic_len(topics::PROCESSED_INTERACTIONS), 2);

        // Window reset: the uncommitted record replays and goes through.
        extractor.reset_window();
        assert_eq!(connector.run_once(10).await.unwrap(), 1);
        assert_eq!(bus.topic_len(topics::PROCESSED_INTERACTIONS), 3);
    }

    #[test]
    fn test_crm_rate_limit_counter() {
        let extractor = CrmExtractor::default().with_daily_limit(1);
        let normalizer = FormatNormalizer::new();
        let raw = json!({"Id": "003ZZ", "Email": "z@uni.edu"});

        assert!(extractor.extract(&raw, &normalizer).is_ok());
        let err = extractor.extract(&raw, &normalizer).expect_err("over budget");
        assert!(matches!(err, CdpError::RateLimit(_)));

        extractor.reset_window();
        assert!(extractor.extract(&raw, &normalizer).is_ok());
    }

    #[tokio::test]
    async fn test_crm_csv_import_path() {
        let extractor = CrmExtractor::default();
        let normalizer = FormatNormalizer::new();
        let mut row = Map::new();
        row.insert("Id".to_string(), json!("003YY"));
        row.insert("Email".to_string(), json!("bob@uni.edu"));
        let event = extractor.csv_row(&row, &normalizer);
        assert_eq!(event.event_type, "crm.lead.csv_import");
        assert_eq!(event.student_id.as_deref(), Some("003YY"));
    }
}
