//! Structured JSON logging with PII redaction.
//!
//! Every log event carries the service name, environment tag, and an
//! ISO-8601 timestamp; pipeline stages attach a per-message correlation ID
//! as a span field. Values derived from source payloads must pass through
//! [`redact_field`] (or [`redact_text`]) before being logged: keys on the
//! PII blocklist are replaced wholesale with `[REDACTED]`, and email/phone
//! substrings are replaced in place inside free text.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub const REDACTED: &str = "[REDACTED]";

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email regex")
});

static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+?\d[\d\-\s()]{7,}\d").expect("phone regex"));

static PII_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "email",
        "email_address",
        "phone",
        "phone_number",
        "mobile",
        "first_name",
        "last_name",
        "full_name",
        "name",
        "student_name",
        "guardian_name",
        "parent_email",
        "personal_email",
    ]
    .into_iter()
    .collect()
});

/// Initialize the global JSON subscriber. `RUST_LOG` controls filtering;
/// defaults to `info`.
pub fn init(service_name: &str, environment: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .with_target(true)
        .init();
    info!(service = service_name, environment = environment, "logging initialized");
}

/// Fresh correlation ID for a unit of work (one consumed message, one
/// webhook request, one erasure run).
pub fn new_correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Replace email and phone substrings inside free text.
pub fn redact_text(value: &str) -> String {
    let step = EMAIL_RE.replace_all(value, REDACTED);
    PHONE_RE.replace_all(&step, REDACTED).into_owned()
}

/// Redact a key/value pair destined for a log field. Blocklisted keys are
/// replaced wholesale; other values only have PII substrings scrubbed.
pub fn redact_field(key: &str, value: &str) -> String {
    if PII_KEYS.contains(key.to_ascii_lowercase().as_str()) {
        return REDACTED.to_string();
    }
    redact_text(value)
}
