//! Webhook wire types.
//!
//! The camera controller posts
//!
//! ```json
//! {"alarm": {"triggers": [{"device": "e063da0", "key": "license_plate",
//!   "value": "ABC123", "timestamp": 1748260800000}]}, "timestamp": 1748260800000}
//! ```
//!
//! Field types vary between firmware versions (plates and ids sometimes
//! arrive as numbers, timestamps as strings), so the payload is kept as
//! loose JSON values and read through the accessors below.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub alarm: Alarm,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Alarm {
    #[serde(default)]
    pub triggers: Vec<Trigger>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Trigger {
    #[serde(default)]
    pub device: Option<Value>,
    #[serde(default)]
    pub key: Option<Value>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

/// The fields of the first trigger, with the top-level timestamp as
/// fallback.  Empty strings are reported as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerFields {
    pub device_id: Option<String>,
    pub key: Option<String>,
    pub license_plate: Option<String>,
    pub timestamp_ms: Option<i64>,
}

impl WebhookPayload {
    /// Parse a request body.  Malformed JSON yields an empty payload (no
    /// triggers) so the caller answers "missing data".
    pub fn from_bytes(body: &[u8]) -> Self {
        match serde_json::from_slice(body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Malformed webhook payload: {e}");
                Self::default()
            }
        }
    }

    pub fn trigger_fields(&self) -> TriggerFields {
        let Some(trigger) = self.alarm.triggers.first() else {
            return TriggerFields::default();
        };
        TriggerFields {
            device_id: trigger.device.as_ref().and_then(as_text),
            key: trigger.key.as_ref().and_then(as_text),
            license_plate: trigger.value.as_ref().and_then(as_text),
            timestamp_ms: trigger
                .timestamp
                .as_ref()
                .and_then(as_millis)
                .or_else(|| self.timestamp.as_ref().and_then(as_millis)),
        }
    }
}

fn as_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn as_millis(value: &Value) -> Option<i64> {
    let ms = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    (ms > 0).then_some(ms)
}

// ── responses ────────────────────────────────────────────────────────────

/// Outcome of the barrier action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierStatus {
    pub status: String,
    pub message: String,
}

/// Body returned to the webhook caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub videos: Vec<String>,
    pub barrier: Option<BarrierStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_created: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_path: Option<String>,
}

impl WebhookResponse {
    pub fn received() -> Self {
        Self {
            status: "received".to_string(),
            ..Self::default()
        }
    }

    pub fn missing_data() -> Self {
        Self {
            error: Some("Missing required webhook data".to_string()),
            ..Self::received()
        }
    }
}

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
}
