//! Webhook ingress contracts: signature verification and payload decoding
//! for the messaging (WhatsApp) and email providers.
//!
//! The HTTP endpoints live in the API façade; they delegate here and map
//! verification failures to 403. Publishing targets the source-specific raw
//! topics, keyed by sender / recipient for partition ordering.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::Sha1;
use sha2::Sha256;
use tracing::{info, warn};

use cdp_bus::{topics, EventPublisher};
use cdp_core::error::{CdpError, CdpResult};
use cdp_core::logging::redact_text;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

// ─── Signature verification ─────────────────────────────────────────────

/// Messaging-provider signing: HMAC-SHA1 hex over `url + sorted(params)`
/// (form-encoded). An empty secret disables verification (dev only).
pub fn verify_messaging_signature(
    secret: &str,
    url: &str,
    params: &BTreeMap<String, String>,
    signature: &str,
) -> bool {
    if secret.is_empty() {
        warn!("messaging webhook secret not set, skipping signature verification");
        return true;
    }
    let encoded: String = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let data = format!("{url}{encoded}");

    let mut mac = match HmacSha1::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(data.as_bytes());
    match hex::decode(signature) {
        Ok(expected) => mac.verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}

/// Email-provider signing: HMAC-SHA256 hex over the raw request body.
pub fn verify_email_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        warn!("email webhook secret not set, skipping signature verification");
        return true;
    }
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);
    match hex::decode(signature) {
        Ok(expected) => mac.verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}

// ─── Messaging (WhatsApp) ───────────────────────────────────────────────

/// Raw event published to `cdp.raw.whatsapp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppRawEvent {
    pub from_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub num_media: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_status: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// `message` or `status`.
    pub event_kind: String,
}

/// Decode the provider's form fields (`From`, `Body`, `NumMedia`,
/// `MessageSid`, `MessageStatus`, `MediaUrl{i}`).
pub fn decode_messaging_form(params: &BTreeMap<String, String>) -> CdpResult<WhatsAppRawEvent> {
    let from_number = params.get("From").cloned().unwrap_or_default();
    if from_number.is_empty() {
        return Err(CdpError::Validation("messaging webhook missing From".into()));
    }
    let num_media: u32 = params
        .get("NumMedia")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let media_urls: Vec<String> = (0..num_media)
        .filter_map(|i| params.get(&format!("MediaUrl{i}")).cloned())
        .collect();
    let message_status = params
        .get("MessageStatus")
        .filter(|s| !s.is_empty())
        .cloned();
    let event_kind = if message_status.is_some() {
        "status"
    } else {
        "message"
    };

    Ok(WhatsAppRawEvent {
        from_number,
        body: params.get("Body").filter(|s| !s.is_empty()).cloned(),
        media_urls,
        num_media,
        message_sid: params.get("MessageSid").filter(|s| !s.is_empty()).cloned(),
        message_status,
        timestamp: Utc::now(),
        event_kind: event_kind.to_string(),
    })
}

/// Verifies and publishes messaging callbacks.
pub struct MessagingWebhook {
    publisher: Arc<EventPublisher>,
    secret: String,
}

impl MessagingWebhook {
    pub fn new(publisher: Arc<EventPublisher>, secret: impl Into<String>) -> Self {
        Self {
            publisher,
            secret: secret.into(),
        }
    }

    /// Handle one callback. Signature mismatch is a validation error the
    /// façade maps to 403.
    pub async fn handle(
        &self,
        url: &str,
        params: &BTreeMap<String, String>,
        signature: &str,
    ) -> CdpResult<()> {
        if !verify_messaging_signature(&self.secret, url, params, signature) {
            return Err(CdpError::Validation("invalid messaging signature".into()));
        }
        let event = decode_messaging_form(params)?;
        self.publisher
            .publish_json(topics::RAW_WHATSAPP, Some(&event.from_number), &event)
            .await?;
        info!(
            kind = %event.event_kind,
            from = %redact_text(&event.from_number),
            "messaging event published"
        );
        Ok(())
    }
}

// ─── Email provider ─────────────────────────────────────────────────────

const EMAIL_EVENT_TYPES: [&str; 4] = [
    "email_opened",
    "email_clicked",
    "email_bounced",
    "email_unsubscribed",
];

// Apple Mail Privacy Protection proxies opens; flag them so analytics can
// filter machine opens.
const MACHINE_OPEN_INDICATORS: [&str; 2] = ["apple", "cfnetwork"];

/// Raw event published to `cdp.raw.email`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailRawEvent {
    pub event_type: String,
    pub recipient_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounce_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub is_machine_open: bool,
    pub timestamp: DateTime<Utc>,
    pub raw_payload: Value,
}

fn detect_machine_open(user_agent: Option<&str>) -> bool {
    match user_agent {
        None => false,
        Some(ua) => {
            let ua = ua.to_ascii_lowercase();
            MACHINE_OPEN_INDICATORS.iter().any(|ind| ua.contains(ind))
        }
    }
}

/// Decode an email-provider callback body.
pub fn decode_email_event(payload: &Value) -> CdpResult<EmailRawEvent> {
    let event_type = payload
        .get("event_type")
        .or_else(|| payload.get("event"))
        .and_then(Value::as_str)
        .unwrap_or("");
    if !EMAIL_EVENT_TYPES.contains(&event_type) {
        return Err(CdpError::Validation(format!(
            "unsupported email event_type: {event_type}"
        )));
    }
    let recipient_email = payload
        .get("recipient_email")
        .or_else(|| payload.get("email"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    if recipient_email.is_empty() {
        return Err(CdpError::Validation("email event missing recipient".into()));
    }

    let user_agent = payload
        .get("user_agent")
        .or_else(|| payload.get("useragent"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let is_machine_open =
        event_type == "email_opened" && detect_machine_open(user_agent.as_deref());

    let opt = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    Ok(EmailRawEvent {
        event_type: event_type.to_string(),
        recipient_email,
        campaign_id: opt("campaign_id"),
        link_url: opt("url"),
        bounce_type: opt("bounce_type"),
        user_agent,
        ip_address: opt("ip"),
        is_machine_open,
        timestamp: Utc::now(),
        raw_payload: payload.clone(),
    })
}

/// Verifies and publishes email-provider callbacks.
pub struct EmailWebhook {
    publisher: Arc<EventPublisher>,
    secret: String,
}

impl EmailWebhook {
    pub fn new(publisher: Arc<EventPublisher>, secret: impl Into<String>) -> Self {
        Self {
            publisher,
            secret: secret.into(),
        }
    }

    pub async fn handle(&self, body: &[u8], signature: &str) -> CdpResult<()> {
        if !verify_email_signature(&self.secret, body, signature) {
            return Err(CdpError::Validation("invalid email webhook signature".into()));
        }
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| CdpError::Deserialization(e.to_string()))?;
        let event = decode_email_event(&payload)?;
        self.publisher
            .publish_json(topics::RAW_EMAIL, Some(&event.recipient_email), &event)
            .await?;
        info!(
            event_type = %event.event_type,
            recipient = %redact_text(&event.recipient_email),
            machine_open = event.is_machine_open,
            "email event published"
        );
        Ok(())
    }
}
