use crate::event::{ValidationError, Validator};
use crate::gateway::publisher::Publisher;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Shared state for the gateway handlers
pub struct GatewayState {
    pub validator: Validator,
    pub publisher: Arc<Publisher>,
    pub request_timeout: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub status: String,
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub trace_id: String,
    pub request_id: String,
}

/// POST /ingest
///
/// The publish runs on its own task, so a request that times out still lets
/// the event reach the log; the caller is told the outcome is unknown.
pub async fn ingest(
    State(state): State<Arc<GatewayState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let event = state.validator.validate(&body)?;
    let trace_id = event.trace_id.clone();
    let request_id = event.request_id.clone();

    let publisher = state.publisher.clone();
    let publish = tokio::spawn(async move { publisher.publish(&event).await });

    match tokio::time::timeout(state.request_timeout, publish).await {
        Ok(Ok(Ok(position))) => Ok((
            StatusCode::ACCEPTED,
            Json(IngestResponse {
                status: "accepted".to_string(),
                topic: state.publisher.topic().to_string(),
                partition: position.partition,
                offset: position.offset,
                trace_id,
                request_id,
            }),
        )),
        Ok(Ok(Err(e))) => {
            error!(request_id = %request_id, error = %e, "Publish failed");
            Err(ApiError::PublishFailed(e.to_string()))
        }
        Ok(Err(e)) => {
            error!(request_id = %request_id, error = %e, "Publish task failed");
            Err(ApiError::PublishFailed(e.to_string()))
        }
        Err(_) => {
            warn!(
                request_id = %request_id,
                timeout_ms = state.request_timeout.as_millis() as u64,
                "Request timed out while publishing"
            );
            Err(ApiError::Timeout { request_id })
        }
    }
}

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}

/// Any method other than POST on /ingest
pub async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    MethodNotAllowed,
    PublishFailed(String),
    Timeout { request_id: String },
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Validation(e)
    }
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(e) => e.code(),
            ApiError::MethodNotAllowed => "method_not_allowed",
            ApiError::PublishFailed(_) => "publish_failed",
            ApiError::Timeout { .. } => "request_timeout",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message) = match self {
            ApiError::Validation(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                "only POST is accepted".to_string(),
            ),
            ApiError::PublishFailed(detail) => (
                StatusCode::BAD_GATEWAY,
                format!("event was not accepted: {}", detail),
            ),
            ApiError::Timeout { request_id } => (
                StatusCode::GATEWAY_TIMEOUT,
                format!(
                    "timed out waiting for the log; event {} may have been accepted",
                    request_id
                ),
            ),
        };

        (
            status,
            Json(serde_json::json!({ "error": code, "message": message })),
        )
            .into_response()
    }
}
