//! Error types for the sync engine.

use remora_types::Location;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
///
/// Cloneable so one failed in-flight request can be reported to every caller
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The server rejected our credentials (HTTP 401).
    #[error("session with {address} is no longer authorized")]
    Unauthorized { address: String },

    /// The user may not access a schema (HTTP 403).
    #[error("access to {schema:?} on {address} denied")]
    Forbidden {
        address: String,
        schema: Option<String>,
    },

    /// A required search could not be satisfied even after asking the server.
    #[error("required objects not found at {location}")]
    NotFound { location: Location },

    /// Local write and server state diverged (HTTP 409).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Server unreachable.
    #[error("network error: {0}")]
    Network(String),

    /// Any other non-success HTTP status.
    #[error("server responded {status}: {message}")]
    Http { status: u16, message: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Local cache failure.
    #[error("cache error: {0}")]
    Cache(String),

    /// No session exists for the address, or it is not authorized yet.
    #[error("no authorized session for {address}")]
    NoSession { address: String },

    /// The engine is offline.
    #[error("offline")]
    Offline,

    /// The operation was canceled.
    #[error("operation canceled")]
    Canceled,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Returns true when the server could not be reached at all; callers
    /// degrade to cached data.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Timeout | SyncError::Offline
        )
    }

    /// Returns true for errors tied to the session rather than the request.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            SyncError::Unauthorized { .. } | SyncError::NoSession { .. }
        )
    }

    /// HTTP status behind this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Unauthorized { .. } => Some(401),
            SyncError::Forbidden { .. } => Some(403),
            SyncError::Conflict(_) => Some(409),
            SyncError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<remora_types::Error> for SyncError {
    fn from(e: remora_types::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}
