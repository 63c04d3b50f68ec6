//! API error types and JSON error response formatting.
//!
//! Every domain error maps onto an HTTP status and a `{error, message}`
//! JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use deputy_action::{ActionError, PolicyError, TrustError};
use deputy_core::error::DeputyError;

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "not_found").
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request - missing or invalid parameters.
    BadRequest(String),
    /// 404 Not Found - resource does not exist.
    NotFound(String),
    /// 409 Conflict - the resource is not in a state that allows this.
    Conflict(String),
    /// 422 Unprocessable Entity - valid syntax but semantic validation failure.
    UnprocessableEntity(String),
    /// 500 Internal Server Error - unexpected server error.
    Internal(String),
    /// 503 Service Unavailable - audit log unwritable or shutting down.
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::UnprocessableEntity(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable_entity", msg)
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal API error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
            }
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
        };

        let body = ErrorBody {
            error: error_code.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

impl From<DeputyError> for ApiError {
    fn from(err: DeputyError) -> Self {
        match &err {
            DeputyError::Config(msg) => ApiError::BadRequest(msg.clone()),
            DeputyError::AuditWrite(_) | DeputyError::ShuttingDown => {
                ApiError::ServiceUnavailable(err.to_string())
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ActionError> for ApiError {
    fn from(err: ActionError) -> Self {
        match err {
            ActionError::InvalidAction(msg) => ApiError::UnprocessableEntity(msg),
            ActionError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ActionError::Transition(_) => ApiError::Conflict(err.to_string()),
            ActionError::AuditWriteFailure(_) | ActionError::ShuttingDown => {
                ApiError::ServiceUnavailable(err.to_string())
            }
            ActionError::Storage(e) => e.into(),
        }
    }
}

impl From<TrustError> for ApiError {
    fn from(err: TrustError) -> Self {
        match err {
            TrustError::NotEligible { .. }
            | TrustError::AtMaximumLevel(_)
            | TrustError::Conflict { .. } => ApiError::Conflict(err.to_string()),
            TrustError::NotConfirmed => ApiError::BadRequest(err.to_string()),
            TrustError::InvalidLevel(_) => ApiError::UnprocessableEntity(err.to_string()),
            TrustError::Storage(e) => e.into(),
        }
    }
}

impl From<PolicyError> for ApiError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::InvalidPolicy(msg) => ApiError::UnprocessableEntity(msg),
            PolicyError::NotFound(_) => ApiError::NotFound(err.to_string()),
            PolicyError::Submit(e) => e.into(),
            PolicyError::Storage(e) => e.into(),
        }
    }
}
