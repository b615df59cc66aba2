use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::types::{EventId, SubscriptionId};

/// Persistence layer failure.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("stored record could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for StorageError {
    fn from(err: tokio_postgres::Error) -> Self {
        StorageError::Unavailable(err.to_string())
    }
}

/// Errors returned when work cannot be handed to the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Dispatcher has been shut down.
    #[error("dispatcher is shut down")]
    Shutdown,
}

/// Errors surfaced synchronously to callers of the registry, recorder,
/// ledger and dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("event not found: {0}")]
    EventNotFound(EventId),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl WebhookError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            WebhookError::SubscriptionNotFound(_) | WebhookError::EventNotFound(_)
        )
    }
}

/// JSON error body returned by the management API.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            WebhookError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            WebhookError::SubscriptionNotFound(_) => {
                (StatusCode::NOT_FOUND, "subscription_not_found")
            }
            WebhookError::EventNotFound(_) => (StatusCode::NOT_FOUND, "event_not_found"),
            WebhookError::Storage(_) => (StatusCode::SERVICE_UNAVAILABLE, "storage_error"),
            WebhookError::Dispatch(_) => (StatusCode::SERVICE_UNAVAILABLE, "dispatch_error"),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
            status: status.as_u16(),
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, WebhookError>;

/// Outcome of one HTTP delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(FailureReason),
}

/// Why an attempt counted as a failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("HTTP {0}")]
    HttpStatus(u16),

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request error: {0}")]
    Request(String),
}
