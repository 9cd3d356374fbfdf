//! The session manager: reconnect tokens for every player in a room.
//!
//! Responsibilities:
//! - Issuing a reconnect token when a player joins
//! - Tracking which sessions are connected or waiting to reconnect
//! - Resolving a token back to its session id on a new connection
//! - Expiring sessions whose grace window has passed
//!
//! # Concurrency note
//!
//! `SessionManager` is a plain struct with `HashMap`s. It is owned by the
//! server's connection layer and shared behind a mutex there; nothing in
//! here locks.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;

use rand::Rng;
use roomcast_protocol::SessionId;
use tokio::time::Instant;

use crate::{Session, SessionConfig, SessionError, SessionState};

/// Registry of reconnectable sessions.
///
/// ## Lifecycle
///
/// ```text
/// create() ──→ disconnect() ──→ reconnect()
///    │               │                │
///    ▼               ▼                ▼
/// [Connected]   [Disconnected]   [Connected]
///                    │
///                    ▼ (after grace window)
///               [Expired] ──→ cleanup_expired()
/// ```
///
/// The room decides when a player is really gone; it calls
/// [`remove`](Self::remove) on leave so the token stops working at once.
#[derive(Debug)]
pub struct SessionManager {
    sessions: HashMap<SessionId, Session>,
    /// `token → session id`, kept in sync with `sessions`.
    tokens: HashMap<String, SessionId>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            tokens: HashMap::new(),
            config,
        }
    }

    /// Creates a session for a freshly joined player and issues its token.
    ///
    /// A disconnected or expired session under the same id is replaced
    /// and its old token invalidated.
    ///
    /// # Errors
    /// [`SessionError::AlreadyConnected`] if the id is connected already.
    pub fn create(&mut self, session_id: SessionId) -> Result<&Session, SessionError> {
        if let Some(existing) = self.sessions.get(&session_id) {
            if existing.state == SessionState::Connected {
                return Err(SessionError::AlreadyConnected(session_id));
            }
            self.tokens.remove(&existing.reconnect_token);
        }

        let token = generate_token();
        self.tokens.insert(token.clone(), session_id.clone());
        tracing::debug!(%session_id, "session created");

        let session = Session {
            session_id: session_id.clone(),
            state: SessionState::Connected,
            reconnect_token: token,
        };
        let stored = match self.sessions.entry(session_id) {
            Entry::Occupied(mut slot) => {
                slot.insert(session);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(session),
        };
        Ok(&*stored)
    }

    /// Marks a session disconnected and starts its grace window.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] if no session exists.
    pub fn disconnect(&mut self, session_id: &SessionId) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        session.state = SessionState::Disconnected {
            since: Instant::now(),
        };
        tracing::debug!(%session_id, "session disconnected, grace window started");
        Ok(())
    }

    /// Resumes the session `token` belongs to.
    ///
    /// # Errors
    /// - [`SessionError::InvalidToken`]: token not recognized
    /// - [`SessionError::SessionExpired`]: grace window elapsed
    /// - [`SessionError::AlreadyConnected`]: nothing to resume
    pub fn reconnect(&mut self, token: &str) -> Result<&Session, SessionError> {
        let session_id = self
            .tokens
            .get(token)
            .cloned()
            .ok_or(SessionError::InvalidToken)?;
        let grace = self.config.reconnect_grace;

        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(SessionError::InvalidToken)?;

        match session.state {
            SessionState::Disconnected { since } => {
                if since.elapsed() >= grace {
                    session.state = SessionState::Expired;
                    return Err(SessionError::SessionExpired(session_id));
                }
                session.state = SessionState::Connected;
                tracing::debug!(%session_id, "session resumed");
                Ok(&*session)
            }
            SessionState::Connected => Err(SessionError::AlreadyConnected(session_id)),
            SessionState::Expired => Err(SessionError::SessionExpired(session_id)),
        }
    }

    /// Drops a session and its token.
    pub fn remove(&mut self, session_id: &SessionId) -> Option<Session> {
        let session = self.sessions.remove(session_id)?;
        self.tokens.remove(&session.reconnect_token);
        Some(session)
    }

    /// Expires every disconnected session whose grace window has passed.
    ///
    /// Returns the expired ids.
    pub fn expire_stale(&mut self) -> Vec<SessionId> {
        let grace = self.config.reconnect_grace;
        let mut expired = Vec::new();

        for session in self.sessions.values_mut() {
            if let SessionState::Disconnected { since } = session.state {
                if since.elapsed() >= grace {
                    session.state = SessionState::Expired;
                    tracing::debug!(session_id = %session.session_id, "session expired");
                    expired.push(session.session_id.clone());
                }
            }
        }

        expired
    }

    /// Removes every expired session.
    pub fn cleanup_expired(&mut self) {
        self.sessions.retain(|_, session| {
            if session.state == SessionState::Expired {
                self.tokens.remove(&session.reconnect_token);
                false
            } else {
                true
            }
        });
    }

    /// Changes the grace window for future checks.
    pub fn set_reconnect_grace(&mut self, grace: Duration) {
        self.config.reconnect_grace = grace;
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// 16 random bytes as 32 lowercase hex characters.
fn generate_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// =========================================================================
// Tests
// =========================================================================
