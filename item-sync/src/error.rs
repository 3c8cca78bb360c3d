//! Error types for the sync engine

use crate::model::Item;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::WebSocket(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Failures reported by the remote item API.
///
/// A version conflict is carried here so the transport can report it, but the
/// gateway and the coordinator turn it into a [`crate::model::ConflictPair`]
/// instead of treating it as a failure.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Item not found")]
    NotFound,

    #[error("Version conflict (server version {})", .0.version)]
    Conflict(Box<Item>),

    #[error("Server answered {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether a later attempt may succeed without any change on our side.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            ApiError::NotFound | ApiError::Conflict(_) | ApiError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ApiError::Transport("connection refused".into()).is_retryable());
        assert!(ApiError::Status { status: 503, message: String::new() }.is_retryable());
        assert!(ApiError::Status { status: 429, message: String::new() }.is_retryable());
        assert!(!ApiError::Status { status: 400, message: String::new() }.is_retryable());
        assert!(!ApiError::NotFound.is_retryable());
        assert!(!ApiError::Conflict(Box::default()).is_retryable());
    }

    #[test]
    fn test_conflict_message_names_server_version() {
        let server = Item { version: 7, ..Item::default() };
        let err = ApiError::Conflict(Box::new(server));
        assert_eq!(err.to_string(), "Version conflict (server version 7)");
    }
}
