use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::middleware::StoredResponse;

pub type TollgateResult<T> = Result<T, TollgateError>;

#[derive(Debug, Clone, Error)]
pub enum TollgateError {
    #[error("Missing Idempotency-Key header")]
    MissingKey,

    #[error("Unknown or expired idempotency key: {0}")]
    UnknownKey(String),

    #[error("Invalid idempotency key: {0}")]
    InvalidKey(String),

    #[error("Operation for idempotency key {0} is already in progress")]
    Conflict(String),

    #[error("Too many requests, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Non-success response produced by the wrapped handler, passed through
    /// to the caller but never cached.
    #[error("Handler failed with status {}", .0.status)]
    Handler(StoredResponse),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TollgateError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TollgateError::MissingKey | TollgateError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            TollgateError::UnknownKey(_) => StatusCode::NOT_FOUND,
            TollgateError::Conflict(_) => StatusCode::CONFLICT,
            TollgateError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            TollgateError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            TollgateError::Handler(response) => {
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            TollgateError::Configuration(_)
            | TollgateError::Serialization(_)
            | TollgateError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TollgateError::MissingKey => "missing_idempotency_key",
            TollgateError::UnknownKey(_) => "unknown_idempotency_key",
            TollgateError::InvalidKey(_) => "invalid_idempotency_key",
            TollgateError::Conflict(_) => "operation_in_progress",
            TollgateError::RateLimited { .. } => "rate_limit_exceeded",
            TollgateError::Configuration(_) => "configuration_error",
            TollgateError::StoreUnavailable(_) => "service_unavailable",
            TollgateError::Serialization(_) => "serialization_error",
            TollgateError::Handler(_) => "handler_error",
            TollgateError::Internal(_) => "internal_error",
        }
    }
}

impl From<redis::RedisError> for TollgateError {
    fn from(err: redis::RedisError) -> Self {
        TollgateError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for TollgateError {
    fn from(err: serde_json::Error) -> Self {
        TollgateError::Serialization(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &TollgateError) -> Self {
        Self::new(err.kind(), &err.to_string(), err.status_code().as_u16())
    }
}

impl IntoResponse for TollgateError {
    fn into_response(self) -> Response {
        if let TollgateError::Handler(response) = self {
            return response.into_response();
        }

        let status = self.status_code();
        let mut response = (status, Json(ErrorResponse::from_error(&self))).into_response();
        if let TollgateError::RateLimited { retry_after_secs } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}
