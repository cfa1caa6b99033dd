//! Canonical data model shared by every pipeline stage.
//!
//! All ingestion paths converge on [`CanonicalEvent`]; identity resolution
//! and profile assembly converge on [`Profile`], the golden record. These
//! types are the wire schema for every internal topic, so field names and
//! enum spellings are stable.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CdpError;

/// Maximum length of an identifier value.
pub const MAX_IDENTIFIER_LEN: usize = 512;

/// Cross-system identifier namespaces, in deterministic probe order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    Email,
    Phone,
    DeviceId,
    SessionId,
    SalesforceId,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierType::Email => "email",
            IdentifierType::Phone => "phone",
            IdentifierType::DeviceId => "device_id",
            IdentifierType::SessionId => "session_id",
            IdentifierType::SalesforceId => "salesforce_id",
        }
    }

    /// All types in the order the normalizer emits them. Resolution probes
    /// identifiers in event order, so this ordering makes matching
    /// reproducible across runs.
    pub const ALL: [IdentifierType; 5] = [
        IdentifierType::Email,
        IdentifierType::Phone,
        IdentifierType::DeviceId,
        IdentifierType::SessionId,
        IdentifierType::SalesforceId,
    ];
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `(type, value)` edge in the identity graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub id_type: IdentifierType,
    pub value: String,
}

impl Identifier {
    /// Build an identifier, rejecting empty or oversized values.
    pub fn new(id_type: IdentifierType, value: impl Into<String>) -> Result<Self, CdpError> {
        let value = value.into();
        if value.is_empty() {
            return Err(CdpError::Validation(format!(
                "identifier {id_type} has empty value"
            )));
        }
        if value.len() > MAX_IDENTIFIER_LEN {
            return Err(CdpError::Validation(format!(
                "identifier {id_type} value exceeds {MAX_IDENTIFIER_LEN} chars"
            )));
        }
        Ok(Self { id_type, value })
    }

    /// Unique index key, e.g. `email:s@x.edu`.
    pub fn index_key(&self) -> String {
        format!("{}:{}", self.id_type.as_str(), self.value)
    }
}

/// Originating system for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Website,
    App,
    Crm,
    Email,
    Whatsapp,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Website => "website",
            EventSource::App => "app",
            EventSource::Crm => "crm",
            EventSource::Email => "email",
            EventSource::Whatsapp => "whatsapp",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = CdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "website" => Ok(EventSource::Website),
            "app" => Ok(EventSource::App),
            "crm" => Ok(EventSource::Crm),
            "email" => Ok(EventSource::Email),
            "whatsapp" => Ok(EventSource::Whatsapp),
            other => Err(CdpError::UnknownSource(other.to_string())),
        }
    }
}

/// PII fields. All optional so anonymous and partial profiles validate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl PersonalInfo {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.phone.is_none()
    }
}

/// Normalized event emitted by every ingestion pipeline.
///
/// Regardless of the source shape (JSON, CSV row, WhatsApp text), events are
/// converted into this form before identity resolution. `raw_data` preserves
/// the verbatim source payload for audit; `normalized_data` carries the
/// coerced and mapped fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub event_id: String,
    pub event_type: String,
    pub source: EventSource,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(default)]
    pub raw_data: Value,
    #[serde(default)]
    pub normalized_data: serde_json::Map<String, Value>,
    /// Identifiers in normalizer emission order (email, phone, device_id,
    /// session_id, salesforce_id).
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub personal_info: PersonalInfo,
    /// Channel consent booleans carried by the source payload, if any.
    #[serde(default)]
    pub consent: BTreeMap<String, bool>,
}

impl CanonicalEvent {
    /// Minimal event with a fresh id and empty payloads.
    pub fn new(event_type: impl Into<String>, source: EventSource, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source,
            timestamp,
            student_id: None,
            raw_data: Value::Null,
            normalized_data: serde_json::Map::new(),
            identifiers: Vec::new(),
            personal_info: PersonalInfo::default(),
            consent: BTreeMap::new(),
        }
    }

    /// Non-empty identifier values, used for probabilistic candidate lookup.
    pub fn identifier_values(&self) -> Vec<&str> {
        self.identifiers
            .iter()
            .filter(|i| !i.value.is_empty())
            .map(|i| i.value.as_str())
            .collect()
    }

    /// Whether the event already carries an identifier of the given type.
    pub fn has_identifier_type(&self, id_type: IdentifierType) -> bool {
        self.identifiers.iter().any(|i| i.id_type == id_type)
    }
}

/// Lifecycle stages of a student.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    #[default]
    Anonymous,
    Inquiry,
    Application,
    Enrollment,
    Active,
    Alumni,
    Churned,
}

/// Consent state for a single communication channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentState {
    pub consented: bool,
    pub legal_basis: String,
    pub terms_version: String,
    pub updated_at: DateTime<Utc>,
}

/// Aggregated interaction counters for quick profile reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InteractionSummary {
    pub total_events: u64,
    #[serde(default)]
    pub per_source_count: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_interaction_at: Option<DateTime<Utc>>,
}

/// Scores attached to every profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileScores {
    /// Engagement in `[0, 100]`.
    pub engagement: f64,
    /// Churn risk in `[0, 1]`.
    pub churn_risk: f64,
    /// Enrollment probability in `[0, 1]`.
    pub enrollment_probability: f64,
}

/// The golden record: one unified profile per subject.
///
/// Writes go through compare-and-set on `version`; a persisted profile's
/// identifier pairs are globally unique across the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub profile_id: Uuid,
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub personal_info: PersonalInfo,
    #[serde(default)]
    pub enrollment_status: EnrollmentStatus,
    /// Sorted, deduplicated segment names.
    #[serde(default)]
    pub segments: Vec<String>,
    #[serde(default)]
    pub channel_consent: BTreeMap<String, ConsentState>,
    #[serde(default)]
    pub interaction_summary: InteractionSummary,
    #[serde(default)]
    pub scores: ProfileScores,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    /// Fresh anonymous profile with version 0.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            profile_id: Uuid::new_v4(),
            identifiers: Vec::new(),
            personal_info: PersonalInfo::default(),
            enrollment_status: EnrollmentStatus::Anonymous,
            segments: Vec::new(),
            channel_consent: BTreeMap::new(),
            interaction_summary: InteractionSummary::default(),
            scores: ProfileScores::default(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the profile already carries an identifier of the given type.
    pub fn has_identifier_type(&self, id_type: IdentifierType) -> bool {
        self.identifiers.iter().any(|i| i.id_type == id_type)
    }

    /// Set segment membership, normalizing to sorted unique names.
    pub fn set_segments(&mut self, mut segments: Vec<String>) {
        segments.sort();
        segments.dedup();
        self.segments = segments;
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::new()
    }
}
