//! Error types for the session layer.

use roomcast_protocol::SessionId;

/// Errors that can occur while tracking reconnectable sessions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No session exists for the given id. Either it was never created or
    /// it has already been removed.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The reconnect token doesn't match anything the server issued.
    #[error("invalid reconnect token")]
    InvalidToken,

    /// The reconnect grace window has elapsed.
    #[error("session expired: {0}")]
    SessionExpired(SessionId),

    /// The session is still connected; there is nothing to resume.
    #[error("session {0} is already connected")]
    AlreadyConnected(SessionId),
}
