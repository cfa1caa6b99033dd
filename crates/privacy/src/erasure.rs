//! Right-to-erasure cascade.
//!
//! One subject request fans out to every store behind the pipeline, in a
//! fixed order, with per-store retry and timeout. Partial failures are
//! surfaced (`fully_deleted = false`) for operator-driven remediation, not
//! retried end-to-end. A verification pass re-queries every store for
//! residuals. Everything is audit-logged.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use cdp_bus::{topics, EventPublisher};
use cdp_core::config::ErasureConfig;
use cdp_core::error::CdpResult;
use cdp_profile::store::ProfileStore;

use crate::consent::ConsentManager;

/// Warehouse tables holding subject rows.
pub const WAREHOUSE_TABLES: [&str; 6] = [
    "cdp_bronze.raw_events",
    "cdp_silver.student_profiles",
    "cdp_silver.identity_graph",
    "cdp_gold.unified_profiles",
    "cdp_gold.segment_memberships",
    "cdp_reverse_etl.salesforce_sync",
];

/// One store behind the pipeline that holds subject data.
#[async_trait]
pub trait ErasureTarget: Send + Sync {
    /// Store name as reported in results (e.g. `mongodb`, `bigquery`).
    fn name(&self) -> &'static str;

    /// Hard-delete everything for the subject; returns records affected.
    async fn erase(&self, student_id: &str) -> CdpResult<u64>;

    /// Records still present for the subject.
    async fn residual_count(&self, student_id: &str) -> CdpResult<u64>;

    /// Per-step timeout override (e.g. the bus flush window).
    fn step_timeout(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreResult {
    pub store: String,
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub records_affected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionReport {
    pub student_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub store_results: Vec<StoreResult>,
    pub fully_deleted: bool,
}

impl DeletionReport {
    pub fn failed_stores(&self) -> Vec<&str> {
        self.store_results
            .iter()
            .filter(|r| !r.deleted)
            .map(|r| r.store.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub student_id: String,
    pub verified_at: DateTime<Utc>,
    pub all_clear: bool,
    pub store_checks: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ErasureAuditEntry {
    Delete(DeletionReport),
    VerifyDeletion(VerificationResult),
}

/// Cascade deletion across every registered store.
pub struct ErasureOrchestrator {
    targets: Vec<Arc<dyn ErasureTarget>>,
    audit: RwLock<Vec<ErasureAuditEntry>>,
    config: ErasureConfig,
}

impl ErasureOrchestrator {
    pub fn new(targets: Vec<Arc<dyn ErasureTarget>>, config: ErasureConfig) -> Self {
        Self {
            targets,
            audit: RwLock::new(Vec::new()),
            config,
        }
    }

    /// Orchestrate full erasure with per-store retry.
    pub async fn delete_student(&self, student_id: &str) -> CdpResult<DeletionReport> {
        let started_at = Utc::now();
        let start = std::time::Instant::now();
        info!(student_id = student_id, "erasure started");

        let mut store_results = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            store_results.push(self.erase_with_retry(target.as_ref(), student_id).await);
        }

        let fully_deleted = store_results.iter().all(|r| r.deleted);
        let report = DeletionReport {
            student_id: student_id.to_string(),
            started_at,
            completed_at: Utc::now(),
            duration_seconds: start.elapsed().as_secs_f64(),
            store_results,
            fully_deleted,
        };

        self.audit.write().push(ErasureAuditEntry::Delete(report.clone()));

        if report.fully_deleted {
            info!(
                student_id = student_id,
                duration_s = report.duration_seconds,
                "erasure completed"
            );
        } else {
            error!(
                student_id = student_id,
                failed_stores = ?report.failed_stores(),
                "erasure partially failed"
            );
        }
        Ok(report)
    }

    async fn erase_with_retry(&self, target: &dyn ErasureTarget, student_id: &str) -> StoreResult {
        let timeout = target
            .step_timeout()
            .unwrap_or(Duration::from_secs(self.config.step_timeout_secs));
        let mut last_error = String::from("max retries exceeded");

        for attempt in 1..=self.config.max_attempts {
            let outcome = tokio::time::timeout(timeout, target.erase(student_id)).await;
            match outcome {
                Ok(Ok(records_affected)) => {
                    return StoreResult {
                        store: target.name().to_string(),
                        deleted: true,
                        error: None,
                        records_affected,
                    };
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                }
                Err(_) => {
                    last_error = format!("timed out after {}s", timeout.as_secs());
                }
            }
            warn!(
                store = target.name(),
                student_id = student_id,
                attempt = attempt,
                max = self.config.max_attempts,
                error = %last_error,
                "erasure step failed"
            );
            if attempt < self.config.max_attempts {
                tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
            }
        }

        StoreResult {
            store: target.name().to_string(),
            deleted: false,
            error: Some(last_error),
            records_affected: 0,
        }
    }

    /// Re-query every store for residual subject data.
    pub async fn verify_deletion(&self, student_id: &str) -> CdpResult<VerificationResult> {
        let mut store_checks = BTreeMap::new();
        for target in &self.targets {
            let timeout = target
                .step_timeout()
                .unwrap_or(Duration::from_secs(self.config.step_timeout_secs));
            let clear = match tokio::time::timeout(timeout, target.residual_count(student_id)).await
            {
                Ok(Ok(count)) => count == 0,
                Ok(Err(e)) => {
                    warn!(store = target.name(), error = %e, "verification query failed");
                    false
                }
                Err(_) => {
                    warn!(store = target.name(), "verification query timed out");
                    false
                }
            };
            store_checks.insert(target.name().to_string(), clear);
        }

        let result = VerificationResult {
            student_id: student_id.to_string(),
            verified_at: Utc::now(),
            all_clear: store_checks.values().all(|c| *c),
            store_checks,
        };
        self.audit
            .write()
            .push(ErasureAuditEntry::VerifyDeletion(result.clone()));
        info!(
            student_id = student_id,
            all_clear = result.all_clear,
            "erasure verification recorded"
        );
        Ok(result)
    }

    pub fn audit_log(&self) -> Vec<ErasureAuditEntry> {
        self.audit.read().clone()
    }
}

// ─── Store adapters ─────────────────────────────────────────────────────

/// Primary store: profiles plus consent records and their audit trail.
pub struct PrimaryStoreTarget {
    profiles: Arc<dyn ProfileStore>,
    consent: Arc<ConsentManager>,
}

impl PrimaryStoreTarget {
    pub fn new(profiles: Arc<dyn ProfileStore>, consent: Arc<ConsentManager>) -> Self {
        Self { profiles, consent }
    }
}

#[async_trait]
impl ErasureTarget for PrimaryStoreTarget {
    fn name(&self) -> &'static str {
        "mongodb"
    }

    async fn erase(&self, student_id: &str) -> CdpResult<u64> {
        let profiles = self.profiles.delete_subject(student_id).await?;
        let consents = self.consent.erase_subject(student_id);
        Ok(profiles + consents)
    }

    async fn residual_count(&self, student_id: &str) -> CdpResult<u64> {
        Ok(self.profiles.residual_count(student_id).await? + self.consent.residual_count(student_id))
    }
}

/// Subject row in a warehouse table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseRow {
    pub student_id: String,
    pub data: Value,
}

/// In-memory stand-in for the analytics warehouse.
pub struct WarehouseClient {
    tables: DashMap<String, Vec<WarehouseRow>>,
}

impl WarehouseClient {
    pub fn new() -> Arc<Self> {
        let tables = DashMap::new();
        for table in WAREHOUSE_TABLES {
            tables.insert(table.to_string(), Vec::new());
        }
        Arc::new(Self { tables })
    }

    pub fn insert_row(&self, table: &str, row: WarehouseRow) {
        self.tables.entry(table.to_string()).or_default().push(row);
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map(|t| t.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ErasureTarget for WarehouseClient {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    async fn erase(&self, student_id: &str) -> CdpResult<u64> {
        let mut affected = 0;
        for mut table in self.tables.iter_mut() {
            let before = table.len();
            table.retain(|row| row.student_id != student_id);
            affected += (before - table.len()) as u64;
        }
        Ok(affected)
    }

    async fn residual_count(&self, student_id: &str) -> CdpResult<u64> {
        Ok(self
            .tables
            .iter()
            .map(|t| t.iter().filter(|r| r.student_id == student_id).count() as u64)
            .sum())
    }
}

/// Embedding record in the vector index.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub student_id: String,
    pub embedding: Vec<f32>,
}

/// In-memory stand-in for the vector index; deletion filters by subject.
pub struct VectorIndexClient {
    vectors: DashMap<String, VectorRecord>,
}

impl VectorIndexClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            vectors: DashMap::new(),
        })
    }

    pub fn upsert(&self, vector_id: &str, record: VectorRecord) {
        self.vectors.insert(vector_id.to_string(), record);
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

#[async_trait]
impl ErasureTarget for VectorIndexClient {
    fn name(&self) -> &'static str {
        "pinecone"
    }

    async fn erase(&self, student_id: &str) -> CdpResult<u64> {
        let before = self.vectors.len();
        self.vectors.retain(|_, v| v.student_id != student_id);
        Ok((before - self.vectors.len()) as u64)
    }

    async fn residual_count(&self, student_id: &str) -> CdpResult<u64> {
        Ok(self
            .vectors
            .iter()
            .filter(|e| e.value().student_id == student_id)
            .count() as u64)
    }
}

/// In-memory stand-in for the ML feature store, keyed by entity id.
pub struct FeatureStoreClient {
    entities: DashMap<String, Value>,
}

impl FeatureStoreClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entities: DashMap::new(),
        })
    }

    pub fn put_entity(&self, student_id: &str, features: Value) {
        self.entities.insert(student_id.to_string(), features);
    }
}

#[async_trait]
impl ErasureTarget for FeatureStoreClient {
    fn name(&self) -> &'static str {
        "vertex_ai"
    }

    async fn erase(&self, student_id: &str) -> CdpResult<u64> {
        Ok(u64::from(self.entities.remove(student_id).is_some()))
    }

    async fn residual_count(&self, student_id: &str) -> CdpResult<u64> {
        Ok(u64::from(self.entities.contains_key(student_id)))
    }
}

/// Publishes null-valued tombstones keyed by the subject on each
/// integration topic, then flushes within the configured window.
pub struct BusTombstoneTarget {
    publisher: Arc<EventPublisher>,
    flush_timeout: Duration,
}

impl BusTombstoneTarget {
    pub fn new(publisher: Arc<EventPublisher>, config: &ErasureConfig) -> Self {
        Self {
            publisher,
            flush_timeout: Duration::from_secs(config.bus_flush_timeout_secs),
        }
    }
}

#[async_trait]
impl ErasureTarget for BusTombstoneTarget {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn erase(&self, student_id: &str) -> CdpResult<u64> {
        for topic in topics::INTEGRATION_TOPICS {
            self.publisher.publish_tombstone(topic, student_id).await?;
        }
        self.publisher.flush(self.flush_timeout).await?;
        Ok(topics::INTEGRATION_TOPICS.len() as u64)
    }

    async fn residual_count(&self, _student_id: &str) -> CdpResult<u64> {
        // Tombstones compact away retained records; once the flush
        // succeeded there is nothing to re-query.
        Ok(0)
    }

    fn step_timeout(&self) -> Option<Duration> {
        Some(self.flush_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmMapping {
    pub salesforce_id: String,
    pub marked_for_deletion: bool,
}

/// Subject-to-CRM mapping table. Erasure marks the contact for deletion in
/// the CRM and then removes the mapping so no later sync can resurrect the
/// subject.
pub struct CrmMappingTable {
    mappings: DashMap<String, CrmMapping>,
}

impl CrmMappingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mappings: DashMap::new(),
        })
    }

    pub fn insert(&self, student_id: &str, salesforce_id: &str) {
        self.mappings.insert(
            student_id.to_string(),
            CrmMapping {
                salesforce_id: salesforce_id.to_string(),
                marked_for_deletion: false,
            },
        );
    }

    pub fn get(&self, student_id: &str) -> Option<CrmMapping> {
        self.mappings.get(student_id).map(|m| m.clone())
    }
}

#[async_trait]
impl ErasureTarget for CrmMappingTable {
    fn name(&self) -> &'static str {
        "salesforce"
    }

    async fn erase(&self, student_id: &str) -> CdpResult<u64> {
        if let Some(mut mapping) = self.mappings.get_mut(student_id) {
            mapping.marked_for_deletion = true;
            info!(
                salesforce_id = %mapping.salesforce_id,
                "CRM contact deletion requested"
            );
        }
        Ok(u64::from(self.mappings.remove(student_id).is_some()))
    }

    async fn residual_count(&self, student_id: &str) -> CdpResult<u64> {
        Ok(u64::from(self.mappings.contains_key(student_id)))
    }
}

/// Wire the six standard targets in cascade order.
pub fn standard_targets(
    profiles: Arc<dyn ProfileStore>,
    consent: Arc<ConsentManager>,
    warehouse: Arc<WarehouseClient>,
    vectors: Arc<VectorIndexClient>,
    features: Arc<FeatureStoreClient>,
    publisher: Arc<EventPublisher>,
    crm: Arc<CrmMappingTable>,
    config: &ErasureConfig,
) -> Vec<Arc<dyn ErasureTarget>> {
    vec![
        Arc::new(PrimaryStoreTarget::new(profiles, consent)),
        warehouse,
        vectors,
        features,
        Arc::new(BusTombstoneTarget::new(publisher, config)),
        crm,
    ]
}
