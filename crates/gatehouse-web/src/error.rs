//! HTTP error mapping.
//!
//! Every failure leaves the API as `{"error": "...", "code": "..."}` with a
//! status derived from the pipeline error category.

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gatehouse_hitl::HitlError;
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_failed", message)
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<HitlError> for ApiError {
    fn from(err: HitlError) -> Self {
        let message = err.to_string();
        match err {
            HitlError::Validation { .. } => Self::bad_request(message),
            HitlError::NotFound { entity, id } => {
                Self::new(StatusCode::NOT_FOUND, "not_found", message)
                    .with_details(json!({ "entity": entity, "id": id }))
            }
            HitlError::Conflict { entity, id, .. } => {
                Self::new(StatusCode::CONFLICT, "conflict", message)
                    .with_details(json!({ "entity": entity, "id": id }))
            }
            HitlError::IllegalTransition {
                request_id,
                from,
                to,
            } => Self::new(StatusCode::CONFLICT, "illegal_transition", message).with_details(
                json!({ "requestId": request_id, "currentState": from, "attemptedState": to }),
            ),
            HitlError::Expired { approval_id } => {
                Self::new(StatusCode::GONE, "expired", message)
                    .with_details(json!({ "approvalId": approval_id }))
            }
            HitlError::Dispatch { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "dispatch_failed", message)
            }
            HitlError::Notify { .. } | HitlError::Store(_) | HitlError::Config { .. } => {
                tracing::error!(error = %message, "internal error");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.message, "code": self.code });
        if let Some(details) = self.details {
            body["details"] = details;
        }
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
