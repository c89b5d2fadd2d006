use super::{ids, TelemetryEvent, SCHEMA_VERSION};
use chrono::{DateTime, FixedOffset, Utc};
use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Every field an inbound record may carry. Anything else is rejected.
pub const RAW_FIELDS: &[&str] = &[
    "timestamp",
    "service",
    "customer_id",
    "endpoint",
    "method",
    "status_code",
    "latency_ms",
    "trace_id",
    "error",
    "attributes",
    "request_id",
    "ingested_at",
    "schema_version",
    "environment",
];

/// Inbound record exactly as the caller sent it.
///
/// `request_id`, `ingested_at`, `schema_version` and `environment` are accepted
/// on the wire so strict parsing does not reject them, but their values are
/// never read.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawEvent {
    #[serde(default)]
    pub timestamp: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub status_code: Option<i32>,
    #[serde(default)]
    pub latency_ms: Option<i32>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub attributes: Option<BTreeMap<String, String>>,

    #[serde(default)]
    pub request_id: Option<IgnoredAny>,
    #[serde(default)]
    pub ingested_at: Option<IgnoredAny>,
    #[serde(default)]
    pub schema_version: Option<IgnoredAny>,
    #[serde(default)]
    pub environment: Option<IgnoredAny>,
}

/// Structured rejection of an inbound record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("unknown fields: {}", .0.join(", "))]
    UnknownField(Vec<String>),

    #[error("missing required fields: {}", .0.join(", "))]
    MissingField(Vec<&'static str>),
}

impl ValidationError {
    /// Stable machine-readable code returned to HTTP callers.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::MalformedJson(_) => "malformed_json",
            ValidationError::UnknownField(_) => "unknown_field",
            ValidationError::MissingField(_) => "missing_field",
        }
    }
}

impl RawEvent {
    /// Strictly parse a JSON body.
    ///
    /// Unknown keys are reported as [`ValidationError::UnknownField`] before any
    /// type checking happens, so `{"foo": 1}` never surfaces as a type error.
    pub fn parse(body: &[u8]) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ValidationError::MalformedJson(e.to_string()))?;

        let Value::Object(fields) = &value else {
            return Err(ValidationError::MalformedJson(
                "expected a JSON object".to_string(),
            ));
        };

        let unknown: Vec<String> = fields
            .keys()
            .filter(|key| !RAW_FIELDS.contains(&key.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(ValidationError::UnknownField(unknown));
        }

        serde_json::from_value(value).map_err(|e| ValidationError::MalformedJson(e.to_string()))
    }
}

/// Turns raw inbound records into canonical events.
///
/// Holds only deployment configuration; validation itself has no side effects.
#[derive(Debug, Clone)]
pub struct Validator {
    environment: String,
}

impl Validator {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Parse and normalize a request body using the current instant as the
    /// acceptance time.
    pub fn validate(&self, body: &[u8]) -> Result<TelemetryEvent, ValidationError> {
        let raw = RawEvent::parse(body)?;
        self.normalize(raw, Utc::now())
    }

    /// Normalize an already-parsed record accepted at `now`.
    pub fn normalize(
        &self,
        raw: RawEvent,
        now: DateTime<Utc>,
    ) -> Result<TelemetryEvent, ValidationError> {
        let mut missing = Vec::new();
        let service = required(raw.service, "service", &mut missing);
        let customer_id = required(raw.customer_id, "customer_id", &mut missing);
        let endpoint = required(raw.endpoint, "endpoint", &mut missing);
        let method = required(raw.method, "method", &mut missing);
        let status_code = raw.status_code.unwrap_or(0);
        if status_code == 0 {
            missing.push("status_code");
        }
        if !missing.is_empty() {
            return Err(ValidationError::MissingField(missing));
        }

        let now = truncate_to_millis(now);
        let timestamp = raw
            .timestamp
            .map(|ts| truncate_to_millis(ts.with_timezone(&Utc)))
            .unwrap_or(now);

        let trace_id = match raw.trace_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => ids::trace_id(),
        };

        Ok(TelemetryEvent {
            timestamp,
            service,
            customer_id,
            endpoint,
            method,
            status_code,
            latency_ms: raw.latency_ms.unwrap_or(0),
            trace_id,
            error: raw.error.filter(|e| !e.trim().is_empty()),
            attributes: raw.attributes.unwrap_or_default(),
            request_id: ids::request_id(),
            ingested_at: now,
            schema_version: SCHEMA_VERSION,
            environment: self.environment.clone(),
        })
    }
}

fn required(value: Option<String>, name: &'static str, missing: &mut Vec<&'static str>) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => {
            missing.push(name);
            String::new()
        }
    }
}

// Persisted batches carry millisecond timestamps; truncating here keeps the
// in-flight event identical to what a reader decodes later.
fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}
