//! Error taxonomy and the HTTP error envelope.
//!
//! Every failure surfaced by the store carries a stable machine-readable code.
//! Handlers render errors as `{"error":{"code","message","details?"}}` with the
//! HTTP status derived from the code, so clients and peer nodes can react to
//! the code instead of parsing messages.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DocError>;

/// Wire-level error codes shared by every node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    InvalidDocument,
    InvalidQuery,
    DocumentTooLarge,
    DocumentNotFound,
    ShardNotFound,
    TransactionNotFound,
    NoShardsAvailable,
    DocumentAlreadyExists,
    TransactionConflict,
    QueryTimeout,
    TransactionTimeout,
    RateLimited,
    NetworkError,
    InternalError,
    SystemOverloaded,
    MaintenanceMode,
    Unauthorized,
    Forbidden,
}

impl ErrorCode {
    pub fn http_status(self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequest
            | ErrorCode::InvalidDocument
            | ErrorCode::InvalidQuery
            | ErrorCode::DocumentTooLarge => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::DocumentNotFound
            | ErrorCode::ShardNotFound
            | ErrorCode::TransactionNotFound => StatusCode::NOT_FOUND,
            ErrorCode::QueryTimeout | ErrorCode::TransactionTimeout => {
                StatusCode::REQUEST_TIMEOUT
            }
            ErrorCode::DocumentAlreadyExists | ErrorCode::TransactionConflict => {
                StatusCode::CONFLICT
            }
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::NetworkError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ErrorCode::NoShardsAvailable
            | ErrorCode::SystemOverloaded
            | ErrorCode::MaintenanceMode => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DocError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("document too large: {size} bytes (max {max})")]
    DocumentTooLarge { size: usize, max: usize },

    #[error("document not found: {collection}/{id}")]
    DocumentNotFound { collection: String, id: String },

    #[error("shard not found: {0}")]
    ShardNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("no shards available")]
    NoShardsAvailable,

    #[error("hash ring is empty")]
    EmptyRing,

    #[error("no candidate nodes")]
    NoCandidates,

    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("query timed out after {0} ms")]
    QueryTimeout(u64),

    #[error("transaction timed out: {0}")]
    TransactionTimeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// An error envelope returned by a peer node, carried through verbatim.
    #[error("{message}")]
    Remote { code: ErrorCode, message: String },
}

impl DocError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DocError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            DocError::InvalidDocument(_) => ErrorCode::InvalidDocument,
            DocError::InvalidQuery(_) => ErrorCode::InvalidQuery,
            DocError::DocumentTooLarge { .. } => ErrorCode::DocumentTooLarge,
            DocError::DocumentNotFound { .. } => ErrorCode::DocumentNotFound,
            DocError::ShardNotFound(_) | DocError::NodeNotFound(_) => ErrorCode::ShardNotFound,
            DocError::TransactionNotFound(_) => ErrorCode::TransactionNotFound,
            DocError::NoShardsAvailable | DocError::EmptyRing | DocError::NoCandidates => {
                ErrorCode::NoShardsAvailable
            }
            DocError::TransactionConflict(_) => ErrorCode::TransactionConflict,
            DocError::QueryTimeout(_) => ErrorCode::QueryTimeout,
            DocError::TransactionTimeout(_) => ErrorCode::TransactionTimeout,
            DocError::Network(_) => ErrorCode::NetworkError,
            DocError::Internal(_) => ErrorCode::InternalError,
            DocError::Remote { code, .. } => *code,
        }
    }

    /// Transient failures are worth retrying; everything else surfaces as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::NetworkError | ErrorCode::InternalError | ErrorCode::SystemOverloaded
        )
    }
}

impl From<serde_json::Error> for DocError {
    fn from(e: serde_json::Error) -> Self {
        DocError::Internal(format!("serialization failed: {e}"))
    }
}

impl From<reqwest::Error> for DocError {
    fn from(e: reqwest::Error) -> Self {
        DocError::Network(e.to_string())
    }
}

/// The `{"error":{...}}` body shape shared by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code,
                message: message.into(),
                details: None,
            },
        }
    }

    /// Reconstructs the typed error on the requesting side of a forwarded call.
    pub fn into_error(self) -> DocError {
        DocError::Remote {
            code: self.error.code,
            message: self.error.message,
        }
    }
}

impl From<&DocError> for ErrorEnvelope {
    fn from(e: &DocError) -> Self {
        ErrorEnvelope::new(e.code(), e.to_string())
    }
}

impl IntoResponse for DocError {
    fn into_response(self) -> Response {
        let status = self.code().http_status();
        let envelope = ErrorEnvelope::from(&self);
        (status, Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_expected_statuses() {
        assert_eq!(
            ErrorCode::DocumentNotFound.http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ErrorCode::TransactionConflict.http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ErrorCode::QueryTimeout.http_status(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            ErrorCode::InvalidDocument.http_status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn envelope_round_trips_the_code() {
        let err = DocError::DocumentNotFound {
            collection: "users".into(),
            id: "u1".into(),
        };
        let envelope = ErrorEnvelope::from(&err);
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("DOCUMENT_NOT_FOUND"));

        let parsed: ErrorEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.into_error().code(), ErrorCode::DocumentNotFound);
    }
}
