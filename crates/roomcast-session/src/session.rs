//! Session types: the server's record of a reconnectable connection.

use std::time::Duration;

use roomcast_protocol::SessionId;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Configuration for session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a disconnected player has to come back before the session
    /// is expired. `Duration::ZERO` disables reconnection.
    ///
    /// Rooms set this from their `reconnectTimeout` setting.
    pub reconnect_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_grace: Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Where a session is in its lifecycle.
///
/// ```text
///   Connected ──(disconnect)──→ Disconnected ──(timeout)──→ Expired
///       ↑                            │
///       └────────(reconnect)─────────┘
/// ```
///
/// `since` uses Tokio's clock, so tests with a paused runtime control
/// expiry by advancing virtual time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected { since: Instant },
    Expired,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One player's reconnectable session.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub state: SessionState,
    /// Secret the client presents on a new connection to resume this
    /// session. 32 hex characters (128 bits).
    pub reconnect_token: String,
}
