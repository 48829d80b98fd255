//! Error types for the sync client.

use thiserror::Error;

use crate::entity::EntityKind;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Literal body the backend returns when a request is denied.
pub const UNAUTHORIZED_BODY: &str = "Unauthorized\n";

/// Errors that can occur while talking to the backend or updating the cache.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The backend denied the request. The entity is kept and retried on the
    /// next poll.
    #[error("unauthorized")]
    Unauthorized,

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other non-success HTTP status.
    #[error("http {status}: {body}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body as text.
        body: String,
    },

    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body was not the JSON we expected.
    #[error("decode error: {0}")]
    Decode(String),

    /// A payload was missing required fields.
    #[error("malformed {kind} payload: {reason}")]
    Malformed {
        /// Kind being ingested.
        kind: EntityKind,
        /// What was wrong with it.
        reason: String,
    },

    /// A collection name did not map to any known entity kind.
    #[error("unknown entity kind: {0}")]
    UnknownKind(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Persistence failure.
    #[error("persistence error: {0}")]
    Persist(#[from] claw_persist::PersistError),
}

impl SyncError {
    /// Build the error for a non-success response, recognizing the backend's
    /// unauthorized sentinel body.
    pub fn from_status(status: u16, body: String) -> Self {
        if body == UNAUTHORIZED_BODY {
            Self::Unauthorized
        } else if status == 404 {
            Self::NotFound(body)
        } else {
            Self::Http { status, body }
        }
    }

    /// Whether this is the "denied, try again later" case.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}
