//! Request error taxonomy.
//!
//! # Responsibilities
//! - Define the error kinds a pipeline stage may fail with
//! - Carry a message and structured metadata for diagnostics
//! - Render the uniform `{code, message, metadata, status}` error body
//!
//! # Design Decisions
//! - Stages return `RequestError`; they never write transport responses
//! - Each transport adapter converts a `RequestError` exactly once
//! - Store failures are never recovered locally, they become 500s

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::store::StoreError;

/// Error categories, each mapped to an HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    PaymentRequired,
    Forbidden,
    NotFound,
    RequestTimeout,
    TooManyRequests,
    InternalServerError,
}

impl ErrorKind {
    /// HTTP status code for this kind.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::PaymentRequired => 402,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::RequestTimeout => 408,
            ErrorKind::TooManyRequests => 429,
            ErrorKind::InternalServerError => 500,
        }
    }

    /// Map a status code back to a kind. Unknown codes are internal errors.
    pub fn from_status_code(code: u16) -> Self {
        match code {
            400 => ErrorKind::BadRequest,
            401 => ErrorKind::Unauthorized,
            402 => ErrorKind::PaymentRequired,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::RequestTimeout,
            429 => ErrorKind::TooManyRequests,
            _ => ErrorKind::InternalServerError,
        }
    }

    /// Stable identifier used as the RPC envelope `type`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::PaymentRequired => "payment_required",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RequestTimeout => "request_timeout",
            ErrorKind::TooManyRequests => "too_many_requests",
            ErrorKind::InternalServerError => "internal_server_error",
        }
    }

    /// Canonical reason phrase.
    pub fn reason(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "Bad Request",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::PaymentRequired => "Payment Required",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "Not Found",
            ErrorKind::RequestTimeout => "Request Timeout",
            ErrorKind::TooManyRequests => "Too Many Requests",
            ErrorKind::InternalServerError => "Internal Server Error",
        }
    }
}

/// A failure raised by a pipeline stage.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct RequestError {
    pub kind: ErrorKind,
    pub message: String,
    pub metadata: Value,
}

impl RequestError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            metadata: Value::Object(Default::default()),
        }
    }

    /// Attach structured metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Rate ceiling exceeded; `retry_after` is in seconds.
    pub fn too_many_requests(message: impl Into<String>, retry_after: u64) -> Self {
        Self::new(ErrorKind::TooManyRequests, message)
            .with_metadata(json!({ "retryAfter": retry_after }))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalServerError, message)
    }

    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }

    /// Retry hint carried by `TooManyRequests` errors.
    pub fn retry_after(&self) -> Option<u64> {
        self.metadata.get("retryAfter").and_then(Value::as_u64)
    }

    /// Uniform body shared by every transport.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.status_code(),
            message: self.message.clone(),
            metadata: self.metadata.clone(),
            status: self.kind.reason().to_string(),
        }
    }
}

impl From<StoreError> for RequestError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "Data store failure");
        RequestError::internal("data store unavailable")
            .with_metadata(json!({ "cause": err.to_string() }))
    }
}

/// Serialized error shape: `{code, message, metadata, status}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
    pub metadata: Value,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(ErrorKind::TooManyRequests.status_code(), 429);
        assert_eq!(ErrorKind::from_status_code(404), ErrorKind::NotFound);
        assert_eq!(ErrorKind::from_status_code(418), ErrorKind::InternalServerError);
    }

    #[test]
    fn test_too_many_requests_carries_retry_after() {
        let err = RequestError::too_many_requests("slow down", 42);
        assert_eq!(err.retry_after(), Some(42));

        let body = err.to_body();
        assert_eq!(body.code, 429);
        assert_eq!(body.status, "Too Many Requests");
        assert_eq!(body.metadata["retryAfter"], 42);
    }

    #[test]
    fn test_store_error_becomes_internal() {
        let err: RequestError = StoreError::Unavailable("connection refused".into()).into();
        assert_eq!(err.kind, ErrorKind::InternalServerError);
    }
}
