pub mod health;
pub mod webhooks;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::errors::WebhookError;
use serde::Serialize;

/// Error body returned by the webhook endpoint
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(skip)]
    pub status: StatusCode,
    pub error: &'static str,
    pub message: String,
    pub trace_id: String,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error,
            message: message.into(),
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl From<WebhookError> for ErrorResponse {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::InvalidSignature => {
                Self::new(StatusCode::UNAUTHORIZED, "invalid_signature", err.to_string())
            }
            other => Self::new(StatusCode::BAD_REQUEST, "invalid_delivery", other.to_string()),
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}
