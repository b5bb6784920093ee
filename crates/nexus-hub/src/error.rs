//! Hub error types.

use thiserror::Error;

/// A specialized `Result` type for hub operations.
pub type HubResult<T> = std::result::Result<T, HubError>;

/// Errors surfaced by hub operations. The external HTTP surface maps
/// `Unauthorized` to 401, `Forbidden` to 403, `NotFound` to 404, and the
/// rest to 400/500 as appropriate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HubError {
    /// Missing or invalid bearer token.
    #[error("Authentication required")]
    Unauthorized,

    /// Authenticated but not permitted.
    #[error("Permission denied: {0}")]
    Forbidden(String),

    /// Unknown server, client, route, or role id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request was malformed or a required field was missing.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The server registration is invalid.
    #[error("Invalid server configuration: {0}")]
    InvalidConfiguration(String),

    /// Spawning the child process failed.
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    /// The target exists but is not in a state that allows the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Protocol-level failure on a brokered operation.
    #[error("Protocol error: {0}")]
    Protocol(#[from] nexus_protocol::ProtocolError),

    /// Transport-level failure.
    #[error("Transport error: {0}")]
    Transport(#[from] nexus_transport::TransportError),

    /// Persistence failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(String),
}
