//! API error envelope shared by all handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use relay_knowledge::KnowledgeError;
use relay_lifecycle::LifecycleError;

/// Error payload mapped to the `{"error":{code,message}}` HTTP envelope.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "external_service_error", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": {
                    "code": self.code,
                    "message": self.message,
                }
            })),
        )
            .into_response()
    }
}

impl From<LifecycleError> for ApiError {
    fn from(error: LifecycleError) -> Self {
        match error {
            LifecycleError::Validation(message) => Self::validation(message),
            LifecycleError::NotFound(_) => Self::not_found(error.to_string()),
            LifecycleError::Conflict { .. } => Self::conflict(error.to_string()),
            LifecycleError::Promotion(inner) => inner.into(),
            LifecycleError::Store(_) => Self::internal(error.to_string()),
        }
    }
}

impl From<KnowledgeError> for ApiError {
    fn from(error: KnowledgeError) -> Self {
        match error {
            KnowledgeError::Validation(message) => Self::validation(message),
            KnowledgeError::NotFound(_) => Self::not_found(error.to_string()),
            KnowledgeError::External(_) => Self::external(error.to_string()),
            KnowledgeError::Store(_) => Self::internal(error.to_string()),
        }
    }
}
