use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use snap_core::{EventData, JobEvent};

/// Header carrying the payload signature, value shaped as `sha256=<hex>`.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature-256";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";
pub const USER_AGENT: &str = "snap-webhooks/1.0";

/// Response bodies are stored for debugging but never in full.
pub const RESPONSE_BODY_LIMIT: usize = 1000;

/// A user-registered webhook destination. The secret is server-generated,
/// never accepted from the client, and rotating it invalidates future
/// deliveries signed with the old one.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookConfig {
    pub id: String,
    pub user_id: String,
    pub url: String,
    pub secret: String,
    pub events: Vec<JobEvent>,
    pub is_active: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookConfig {
    pub fn subscribes_to(&self, event: JobEvent) -> bool {
        self.is_active && self.events.contains(&event)
    }
}

pub fn config_id() -> String {
    format!("whc_{}", Uuid::now_v7().simple())
}

/// Status of one delivery batch (one config, one event; possibly several
/// HTTP attempts). Terminal states never carry a `next_retry_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "snap_delivery_status", rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivering,
    Delivered,
    Retrying,
    Failed,
}

/// One send batch for one (config, event) pair. The payload and signature are
/// fixed at creation, so every HTTP attempt sends identical bytes and
/// consumers can deduplicate on the delivery id.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookDelivery {
    pub id: String,
    /// Absent for ad-hoc destinations supplied on the job itself.
    pub webhook_config_id: Option<String>,
    pub user_id: String,
    pub event: JobEvent,
    pub payload: String,
    pub signature: String,
    pub status: DeliveryStatus,
    /// Destination snapshot; config edits don't redirect in-flight batches.
    pub url: String,

    pub attempts: i32,
    pub max_attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,

    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub response_time_ms: Option<i64>,
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookDelivery {
    pub fn signature_header_value(&self) -> String {
        format!("sha256={}", self.signature)
    }
}

/// The canonical wire payload. `data` is an ordered map, so serialization is
/// deterministic and the signature is stable for a given (event, timestamp,
/// data) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub timestamp: String,
    pub data: EventData,
}

impl WebhookPayload {
    pub fn new(event: JobEvent, at: DateTime<Utc>, data: EventData) -> Self {
        Self {
            event: event.as_str().to_string(),
            timestamp: at.to_rfc3339_opts(SecondsFormat::Secs, true),
            data,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Byte-bounded, char-boundary-safe truncation for stored response bodies.
pub fn truncate_response_body(mut body: String, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body;
    }
    let mut cut = max_bytes;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    body.truncate(cut);
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serialization_is_deterministic() {
        let mut data = EventData::new();
        data.insert("jobId".to_string(), "j1".to_string());
        data.insert("aardvark".to_string(), "first".to_string());

        let at = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let payload = WebhookPayload::new(JobEvent::ScreenshotCompleted, at, data);
        let encoded = payload.to_json().unwrap();

        assert_eq!(
            encoded,
            r#"{"event":"SCREENSHOT_COMPLETED","timestamp":"2025-01-01T00:00:00Z","data":{"aardvark":"first","jobId":"j1"}}"#
        );
        // Same inputs, same bytes.
        assert_eq!(encoded, payload.to_json().unwrap());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let body = "héllo wörld".repeat(200);
        let truncated = truncate_response_body(body, RESPONSE_BODY_LIMIT);
        assert!(truncated.len() <= RESPONSE_BODY_LIMIT);
        // Still valid UTF-8 by construction; spot-check the prefix survived.
        assert!(truncated.starts_with("héllo"));
    }

    #[test]
    fn short_bodies_are_untouched() {
        assert_eq!(truncate_response_body("ok".to_string(), 1000), "ok");
    }

    #[test]
    fn subscription_requires_active_and_matching_event() {
        let now = Utc::now();
        let mut config = WebhookConfig {
            id: config_id(),
            user_id: "u1".to_string(),
            url: "https://hooks.example.com".to_string(),
            secret: "s".to_string(),
            events: vec![JobEvent::ScreenshotCompleted],
            is_active: true,
            description: None,
            created_at: now,
            updated_at: now,
        };
        assert!(config.subscribes_to(JobEvent::ScreenshotCompleted));
        assert!(!config.subscribes_to(JobEvent::ScreenshotFailed));

        config.is_active = false;
        assert!(!config.subscribes_to(JobEvent::ScreenshotCompleted));
    }
}
