pub mod ids;
pub mod validate;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub use validate::{RawEvent, ValidationError, Validator};

/// Schema tag stamped on every accepted event.
pub const SCHEMA_VERSION: i32 = 1;

/// Canonical telemetry event as it travels through the log.
///
/// Built only by [`Validator`] on the ingest side and by
/// [`TelemetryEvent::from_log_payload`] on the consumer side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Caller-supplied event time, UTC, millisecond precision
    pub timestamp: DateTime<Utc>,

    pub service: String,
    pub customer_id: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: i32,
    pub latency_ms: i32,
    pub trace_id: String,

    /// Present only on failure events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Free-form attributes; accepted at ingest but not persisted in batches
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,

    /// Server-generated, unique per accepted request
    pub request_id: String,

    /// Set once by the gateway at acceptance time
    pub ingested_at: DateTime<Utc>,

    pub schema_version: i32,
    pub environment: String,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid event payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event is missing required fields: {}", .0.join(", "))]
    Incomplete(Vec<&'static str>),
}

impl TelemetryEvent {
    /// Names of required fields that are blank (or zero, for `status_code`).
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (name, value) in [
            ("service", &self.service),
            ("customer_id", &self.customer_id),
            ("endpoint", &self.endpoint),
            ("method", &self.method),
        ] {
            if value.trim().is_empty() {
                missing.push(name);
            }
        }
        if self.status_code == 0 {
            missing.push("status_code");
        }
        if self.trace_id.trim().is_empty() {
            missing.push("trace_id");
        }
        if self.request_id.trim().is_empty() {
            missing.push("request_id");
        }
        missing
    }

    /// Serialize for the durable log.
    pub fn to_log_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a log payload back into an event, rejecting records that could
    /// never have passed validation.
    pub fn from_log_payload(payload: &[u8]) -> Result<Self, ParseError> {
        let event: TelemetryEvent = serde_json::from_slice(payload)?;
        let missing = event.missing_fields();
        if !missing.is_empty() {
            return Err(ParseError::Incomplete(missing));
        }
        Ok(event)
    }
}
