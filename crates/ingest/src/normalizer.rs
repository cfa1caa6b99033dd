//! Central format normalization.
//!
//! Every raw event, whether it arrives as JSON, a CSV row, or unstructured
//! WhatsApp text, is converted into a [`CanonicalEvent`] here:
//!
//! * timezone normalization (everything to UTC)
//! * field-name mapping (source-specific names to the unified schema)
//! * type coercion (digit strings to integers, date fields to UTC strings)
//! * rule-based intent detection and entity extraction for free text
//!
//! Normalization never fails on malformed input; unparseable timestamps
//! degrade to now(UTC) with a warning.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::warn;
use uuid::Uuid;

use cdp_core::model::{
    CanonicalEvent, EventSource, Identifier, IdentifierType, PersonalInfo,
};

// Named offsets substituted before ISO-8601 parsing.
const NAMED_OFFSETS: [(&str, &str); 5] = [
    ("CEST", "+02:00"),
    ("CET", "+01:00"),
    ("EST", "-05:00"),
    ("PST", "-08:00"),
    ("IST", "+05:30"),
];

static DIGITS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").expect("digits regex"));

static INTENT_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "enrollment_inquiry",
            Regex::new(r"(?i)\b(enroll|admission|apply|register)\b").expect("intent regex"),
        ),
        (
            "program_inquiry",
            Regex::new(r"(?i)\b(program|course|degree|master|bachelor)\b").expect("intent regex"),
        ),
        (
            "fee_inquiry",
            Regex::new(r"(?i)\b(fee|cost|price|tuition|payment)\b").expect("intent regex"),
        ),
        (
            "support_request",
            Regex::new(r"(?i)\b(help|support|problem|issue|error)\b").expect("intent regex"),
        ),
        (
            "schedule_inquiry",
            Regex::new(r"(?i)\b(schedule|deadline|start date|when)\b").expect("intent regex"),
        ),
    ]
});

static ENTITY_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "email",
            Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email regex"),
        ),
        (
            "phone",
            Regex::new(r"\+?\d[\d\-\s()]{7,}\d").expect("phone regex"),
        ),
        (
            "program_name",
            Regex::new(r"(?i)\b(?:B\.?Sc|M\.?Sc|MBA|B\.?A|M\.?A)\b\.?\s*\w*")
                .expect("program regex"),
        ),
    ]
});

/// Best-effort timestamp parsing; always returns UTC.
pub fn parse_timestamp(raw: &Value) -> DateTime<Utc> {
    match raw {
        Value::Number(n) => {
            if let Some(secs) = n.as_f64() {
                let whole = secs.trunc() as i64;
                let nanos = ((secs - secs.trunc()) * 1e9) as u32;
                if let Some(dt) = DateTime::<Utc>::from_timestamp(whole, nanos) {
                    return dt;
                }
            }
            warn!(value = %n, "timestamp number out of range, defaulting to now");
            Utc::now()
        }
        Value::String(s) => parse_timestamp_str(s),
        _ => Utc::now(),
    }
}

/// Parse a timestamp string, substituting common named offsets first.
pub fn parse_timestamp_str(raw: &str) -> DateTime<Utc> {
    let mut cleaned = raw.trim().to_string();
    for (abbr, offset) in NAMED_OFFSETS {
        cleaned = cleaned.replace(abbr, offset);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(&cleaned) {
        return dt.with_timezone(&Utc);
    }
    // Offset separated by a space (e.g. "2025-01-02T10:00:00 +01:00" after
    // named-offset substitution) or space-separated date/time.
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f %:z",
        "%Y-%m-%d %H:%M:%S%.f%:z",
        "%Y-%m-%d %H:%M:%S%.f %:z",
    ] {
        if let Ok(dt) = DateTime::parse_from_str(&cleaned, fmt) {
            return dt.with_timezone(&Utc);
        }
    }
    // Naive inputs are assumed UTC.
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&cleaned, fmt) {
            return naive.and_utc();
        }
    }
    warn!(value = raw, "unparseable timestamp, defaulting to now");
    Utc::now()
}

/// First-match intent over the ordered pattern list.
pub fn detect_intent(text: &str) -> &'static str {
    for (intent, pattern) in INTENT_PATTERNS.iter() {
        if pattern.is_match(text) {
            return intent;
        }
    }
    "general_message"
}

/// Extract known entity types from unstructured text.
pub fn extract_entities(text: &str) -> BTreeMap<String, Vec<String>> {
    let mut entities = BTreeMap::new();
    for (entity_type, pattern) in ENTITY_PATTERNS.iter() {
        let matches: Vec<String> = pattern
            .find_iter(text)
            .map(|m| m.as_str().trim().to_string())
            .collect();
        if !matches.is_empty() {
            entities.insert(entity_type.to_string(), matches);
        }
    }
    entities
}

/// Stateless converter: raw data in any format to [`CanonicalEvent`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatNormalizer;

impl FormatNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalize a raw JSON payload.
    pub fn normalize_json(&self, raw: &Value, source: EventSource) -> CanonicalEvent {
        let obj = raw.as_object().cloned().unwrap_or_default();

        let ts_raw = obj.get("timestamp").or_else(|| obj.get("event_time"));
        let timestamp = match ts_raw {
            Some(v) if !v.is_null() => parse_timestamp(v),
            _ => Utc::now(),
        };

        let event_type = string_field(&obj, &["event_type", "event"])
            .unwrap_or_else(|| "unknown".to_string());
        let student_id = string_field(&obj, &["user_id", "student_id", "Id"]);
        let event_id = string_field(&obj, &["event_id"])
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let normalized_data = coerce_types(&obj);
        let identifiers = collect_identifiers(&normalized_data);
        let personal_info = extract_personal_info(&normalized_data);
        let consent = extract_consent(&obj);

        CanonicalEvent {
            event_id,
            event_type,
            source,
            timestamp,
            student_id,
            raw_data: raw.clone(),
            normalized_data,
            identifiers,
            personal_info,
            consent,
        }
    }

    /// Normalize a single CSV row using a column-name mapping.
    pub fn normalize_csv_row(
        &self,
        row: &Map<String, Value>,
        schema_map: &HashMap<String, String>,
    ) -> CanonicalEvent {
        let mut mapped = Map::new();
        for (csv_col, cdp_field) in schema_map {
            if let Some(value) = row.get(csv_col) {
                mapped.insert(cdp_field.clone(), value.clone());
            }
        }

        let ts_raw = mapped.get("timestamp").or_else(|| mapped.get("event_time"));
        let timestamp = match ts_raw {
            Some(v) if !v.is_null() => parse_timestamp(v),
            _ => Utc::now(),
        };

        let event_type = string_field(&mapped, &["event_type"])
            .unwrap_or_else(|| "csv_import".to_string());
        let student_id = string_field(&mapped, &["student_id", "salesforce_id"]);

        let identifiers = collect_identifiers(&mapped);
        let personal_info = extract_personal_info(&mapped);

        CanonicalEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            source: EventSource::Crm,
            timestamp,
            student_id,
            raw_data: Value::Object(row.clone()),
            normalized_data: mapped,
            identifiers,
            personal_info,
            consent: BTreeMap::new(),
        }
    }

    /// Normalize a WhatsApp text message with rule-based NLP.
    ///
    /// Intent detection and entity extraction are regex-based so the
    /// ingestion path stays fast and deterministic.
    pub fn normalize_whatsapp_text(
        &self,
        message_body: &str,
        metadata: &Map<String, Value>,
    ) -> CanonicalEvent {
        let intent = detect_intent(message_body);
        let entities = extract_entities(message_body);

        let timestamp = match metadata.get("timestamp") {
            Some(v) if !v.is_null() => parse_timestamp(v),
            _ => Utc::now(),
        };

        let from_number = string_field(metadata, &["from_number"]);
        let message_sid = string_field(metadata, &["message_sid"]);

        let mut raw_data = metadata.clone();
        raw_data.insert("body".to_string(), Value::String(message_body.to_string()));

        let mut normalized_data = Map::new();
        normalized_data.insert("intent".to_string(), Value::String(intent.to_string()));
        normalized_data.insert("entities".to_string(), json!(entities));
        normalized_data.insert("from_number".to_string(), json!(from_number));
        normalized_data.insert("message_sid".to_string(), json!(message_sid));
        normalized_data.insert(
            "body_length".to_string(),
            json!(message_body.chars().count()),
        );

        // Identifier order: extracted email first, then the best-known phone.
        let mut identifiers = Vec::new();
        if let Some(email) = entities.get("email").and_then(|v| v.first()) {
            if let Ok(id) = Identifier::new(IdentifierType::Email, email.clone()) {
                identifiers.push(id);
            }
        }
        let phone = entities
            .get("phone")
            .and_then(|v| v.first())
            .cloned()
            .or_else(|| from_number.clone());
        if let Some(phone) = phone {
            if let Ok(id) = Identifier::new(IdentifierType::Phone, phone) {
                identifiers.push(id);
            }
        }

        let personal_info = PersonalInfo {
            name: None,
            email: entities.get("email").and_then(|v| v.first()).cloned(),
            phone: identifiers
                .iter()
                .find(|i| i.id_type == IdentifierType::Phone)
                .map(|i| i.value.clone()),
        };

        CanonicalEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type: format!("whatsapp.{intent}"),
            source: EventSource::Whatsapp,
            timestamp,
            student_id: string_field(metadata, &["student_id"]),
            raw_data: Value::Object(raw_data),
            normalized_data,
            identifiers,
            personal_info,
            consent: BTreeMap::new(),
        }
    }
}

/// Best-effort type coercion for common fields: date-like keys become UTC
/// strings, all-digit strings become integers, nulls are preserved.
pub fn coerce_types(data: &Map<String, Value>) -> Map<String, Value> {
    let mut coerced = Map::new();
    for (key, value) in data {
        let out = if value.is_null() {
            value.clone()
        } else if key.ends_with("_at") || key == "timestamp" {
            Value::String(parse_timestamp(value).to_rfc3339())
        } else if let Value::String(s) = value {
            if DIGITS_RE.is_match(s) {
                match s.parse::<i64>() {
                    Ok(n) => Value::Number(n.into()),
                    Err(_) => value.clone(),
                }
            } else {
                value.clone()
            }
        } else {
            value.clone()
        };
        coerced.insert(key.clone(), out);
    }
    coerced
}

/// Pull identifiers out of normalized fields in the fixed type order
/// (email, phone, device_id, session_id, salesforce_id). Resolution probes
/// identifiers in event order, so this order is part of the contract.
pub fn collect_identifiers(normalized: &Map<String, Value>) -> Vec<Identifier> {
    let mut identifiers = Vec::new();
    for id_type in IdentifierType::ALL {
        if let Some(value) = normalized.get(id_type.as_str()).and_then(Value::as_str) {
            if let Ok(id) = Identifier::new(id_type, value) {
                identifiers.push(id);
            }
        }
    }
    identifiers
}

fn extract_personal_info(normalized: &Map<String, Value>) -> PersonalInfo {
    let name = string_field(normalized, &["name"]).or_else(|| {
        let first = string_field(normalized, &["first_name"]);
        let last = string_field(normalized, &["last_name"]);
        match (first, last) {
            (Some(f), Some(l)) => Some(format!("{f} {l}")),
            (Some(f), None) => Some(f),
            (None, Some(l)) => Some(l),
            (None, None) => None,
        }
    });
    PersonalInfo {
        name,
        email: string_field(normalized, &["email"]),
        phone: string_field(normalized, &["phone"]),
    }
}

fn extract_consent(obj: &Map<String, Value>) -> BTreeMap<String, bool> {
    obj.get("consent")
        .and_then(Value::as_object)
        .map(|c| {
            c.iter()
                .filter_map(|(k, v)| v.as_bool().map(|b| (k.clone(), b)))
                .collect()
        })
        .unwrap_or_default()
}

fn string_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        match obj.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_named_offset_substitution() {
        let dt = parse_timestamp_str("2025-01-02T10:00:00 CET");
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 1, 2, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_cest_beats_cet_substitution() {
        // CEST must be replaced as a whole, not as CET + "S".
        let dt = parse_timestamp_str("2025-06-02T10:00:00 CEST");
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_naive_string_assumed_utc() {
        let dt = parse_timestamp_str("2025-01-02T10:00:00");
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 1, 2, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_aware_string_converted_to_utc() {
        let dt = parse_timestamp_str("2025-01-02T10:00:00+05:30");
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 1, 2, 4, 30, 0).unwrap());
    }

    #[test]
    fn test_numeric_timestamp_is_posix_seconds() {
        let dt = parse_timestamp(&json!(1735815600));
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 1, 2, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_unparseable_defaults_to_now() {
        let before = Utc::now();
        let dt = parse_timestamp_str("not a timestamp");
        assert!(dt >= before);
    }

    #[test]
    fn test_intent_first_match_wins() {
        // "apply" (enrollment) appears before any program keyword match.
        assert_eq!(detect_intent("I want to apply for the MBA program"), "enrollment_inquiry");
        assert_eq!(detect_intent("what does the MBA program cost"), "program_inquiry");
        assert_eq!(detect_intent("how much is tuition"), "fee_inquiry");
        assert_eq!(detect_intent("I have a problem logging in"), "support_request");
        assert_eq!(detect_intent("when is the start date"), "schedule_inquiry");
        assert_eq!(detect_intent("hello there"), "general_message");
    }

    #[test]
    fn test_intent_is_case_insensitive() {
        assert_eq!(detect_intent("ENROLL me please"), "enrollment_inquiry");
    }

    #[test]
    fn test_entity_extraction() {
        let entities =
            extract_entities("reach me at alice@uni.edu or +49 151 2345 6789 about the M.Sc program");
        assert_eq!(entities["email"], vec!["alice@uni.edu"]);
        assert!(entities["phone"][0].starts_with("+49"));
        assert!(entities["program_name"][0].to_lowercase().starts_with("m.sc"));
    }

    #[test]
    fn test_coerce_types() {
        let mut data = Map::new();
        data.insert("count".to_string(), json!("42"));
        data.insert("label".to_string(), json!("42a"));
        data.insert("created_at".to_string(), json!("2025-01-02T10:00:00"));
        data.insert("nothing".to_string(), Value::Null);

        let out = coerce_types(&data);
        assert_eq!(out["count"], json!(42));
        assert_eq!(out["label"], json!("42a"));
        assert_eq!(out["created_at"], json!("2025-01-02T10:00:00+00:00"));
        assert!(out["nothing"].is_null());
    }

    #[test]
    fn test_normalize_json_defaults() {
        let normalizer = FormatNormalizer::new();
        let raw = json!({"event": "page_view", "user_id": "u-1"});
        let event = normalizer.normalize_json(&raw, EventSource::Website);
        assert_eq!(event.event_type, "page_view");
        assert_eq!(event.student_id.as_deref(), Some("u-1"));
        assert_eq!(event.source, EventSource::Website);
        assert_eq!(event.raw_data, raw);
        assert!(!event.event_id.is_empty());
    }

    #[test]
    fn test_normalize_json_unknown_event_type() {
        let normalizer = FormatNormalizer::new();
        let event = normalizer.normalize_json(&json!({}), EventSource::App);
        assert_eq!(event.event_type, "unknown");
    }

    #[test]
    fn test_identifier_collection_order() {
        let raw = json!({
            "salesforce_id": "SF1",
            "session_id": "S1",
            "email": "a@x.edu",
            "device_id": "D1",
            "phone": "+4912345678"
        });
        let normalizer = FormatNormalizer::new();
        let event = normalizer.normalize_json(&raw, EventSource::Website);
        let types: Vec<_> = event.identifiers.iter().map(|i| i.id_type).collect();
        assert_eq!(
            types,
            vec![
                IdentifierType::Email,
                IdentifierType::Phone,
                IdentifierType::DeviceId,
                IdentifierType::SessionId,
                IdentifierType::SalesforceId,
            ]
        );
    }

    #[test]
    fn test_normalize_csv_row() {
        let normalizer = FormatNormalizer::new();
        let mut row = Map::new();
        row.insert("Id".to_string(), json!("003XX"));
        row.insert("Email".to_string(), json!("s@x.edu"));
        row.insert("Unmapped".to_string(), json!("ignored"));

        let schema_map: HashMap<String, String> = [
            ("Id".to_string(), "salesforce_id".to_string()),
            ("Email".to_string(), "email".to_string()),
        ]
        .into();

        let event = normalizer.normalize_csv_row(&row, &schema_map);
        assert_eq!(event.event_type, "csv_import");
        assert_eq!(event.source, EventSource::Crm);
        assert_eq!(event.student_id.as_deref(), Some("003XX"));
        assert_eq!(event.normalized_data["email"], json!("s@x.edu"));
        assert!(!event.normalized_data.contains_key("Unmapped"));
        // Raw row preserved verbatim.
        assert_eq!(event.raw_data["Unmapped"], json!("ignored"));
    }

    #[test]
    fn test_normalize_whatsapp_text() {
        let normalizer = FormatNormalizer::new();
        let mut metadata = Map::new();
        metadata.insert("from_number".to_string(), json!("+4915112345678"));
        metadata.insert("message_sid".to_string(), json!("SM123"));

        let event = normalizer
            .normalize_whatsapp_text("I want to enroll, my email is s@x.edu", &metadata);
        assert_eq!(event.event_type, "whatsapp.enrollment_inquiry");
        assert_eq!(event.source, EventSource::Whatsapp);
        assert_eq!(event.normalized_data["intent"], json!("enrollment_inquiry"));
        assert_eq!(event.normalized_data["message_sid"], json!("SM123"));
        assert_eq!(event.normalized_data["from_number"], json!("+4915112345678"));
        assert_eq!(
            event.normalized_data["body_length"],
            json!("I want to enroll, my email is s@x.edu".chars().count())
        );
        // Email identifier precedes phone.
        assert_eq!(event.identifiers[0].id_type, IdentifierType::Email);
        assert_eq!(event.identifiers[0].value, "s@x.edu");
        assert_eq!(event.identifiers[1].id_type, IdentifierType::Phone);
        // Body preserved in raw_data.
        assert!(event.raw_data["body"].as_str().unwrap().contains("enroll"));
    }
}
