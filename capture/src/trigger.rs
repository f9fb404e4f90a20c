//! Webhook trigger validation.

use chrono::{DateTime, Local, TimeZone, Utc};
use thiserror::Error;

use lpr_common::plate;
use lpr_common::protocol::{TriggerFields, WebhookPayload};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("missing required field: {0}")]
    Missing(&'static str),
    #[error("plate {0:?} has no usable characters")]
    UnusablePlate(String),
    #[error("timestamp {0} out of range")]
    BadTimestamp(i64),
}

/// Earliest accepted event time (2000-01-01T00:00:00Z).
const MIN_EVENT_MS: i64 = 946_684_800_000;

/// How far an event time may lie ahead of the local clock (one day).
const MAX_CLOCK_AHEAD_MS: i64 = 86_400_000;

/// A trigger with every required field present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidTrigger {
    pub device_id: String,
    pub key: String,
    /// Plate as received.
    pub license_plate: String,
    /// Plate reduced to characters safe for paths and record lines.
    pub safe_plate: String,
    pub timestamp_ms: i64,
}

impl ValidTrigger {
    pub fn from_payload(payload: &WebhookPayload) -> Result<Self, TriggerError> {
        Self::from_fields(payload.trigger_fields())
    }

    pub fn from_fields(fields: TriggerFields) -> Result<Self, TriggerError> {
        Self::from_fields_at(fields, Utc::now())
    }

    /// Validate against `now`; the timestamp must lie between
    /// [`MIN_EVENT_MS`] and `now` plus [`MAX_CLOCK_AHEAD_MS`].
    fn from_fields_at(fields: TriggerFields, now: DateTime<Utc>) -> Result<Self, TriggerError> {
        let device_id = fields.device_id.ok_or(TriggerError::Missing("device"))?;
        let key = fields.key.ok_or(TriggerError::Missing("key"))?;
        let license_plate = fields.license_plate.ok_or(TriggerError::Missing("value"))?;
        let timestamp_ms = fields.timestamp_ms.ok_or(TriggerError::Missing("timestamp"))?;

        let safe_plate = plate::sanitize(&license_plate);
        if safe_plate.is_empty() {
            return Err(TriggerError::UnusablePlate(license_plate));
        }
        let latest = now.timestamp_millis().saturating_add(MAX_CLOCK_AHEAD_MS);
        if !(MIN_EVENT_MS..=latest).contains(&timestamp_ms) {
            return Err(TriggerError::BadTimestamp(timestamp_ms));
        }

        Ok(Self {
            device_id,
            key,
            license_plate,
            safe_plate,
            timestamp_ms,
        })
    }

    /// Event time in local time.
    pub fn local_time(&self) -> DateTime<Local> {
        Local
            .timestamp_millis_opt(self.timestamp_ms)
            .single()
            .unwrap_or_else(Local::now)
    }

    /// `YYYY-MM-DD_HH-MM-SS-mmm` label used in inline capture file names.
    pub fn file_label(&self) -> String {
        self.local_time().format("%Y-%m-%d_%H-%M-%S-%3f").to_string()
    }
}
