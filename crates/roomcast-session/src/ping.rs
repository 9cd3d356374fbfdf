//! Outstanding liveness probes.

use std::collections::HashMap;
use std::time::Duration;

use roomcast_protocol::SessionId;
use tokio::time::Instant;

/// A `PING` that hasn't been answered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPing {
    pub ping_id: u64,
    pub sent_at: Instant,
    pub session_id: SessionId,
}

/// Probes awaiting their `PONG`, keyed by ping id.
///
/// Each session has at most one outstanding probe. Issuing a new one
/// drops the previous probe unanswered; lost probes are never retried.
#[derive(Debug, Default)]
pub struct PendingPings {
    next_id: u64,
    pending: HashMap<u64, PendingPing>,
}

impl PendingPings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a probe sent to `session_id` at `now` and returns its id.
    pub fn issue(&mut self, session_id: &SessionId, now: Instant) -> u64 {
        self.forget(session_id);
        self.next_id += 1;
        let ping_id = self.next_id;
        self.pending.insert(
            ping_id,
            PendingPing {
                ping_id,
                sent_at: now,
                session_id: session_id.clone(),
            },
        );
        ping_id
    }

    /// Consumes the probe `ping_id` answered by `session_id`.
    ///
    /// Returns the one-way latency (half the round trip). A reply for an
    /// unknown id, or from a session the probe wasn't sent to, is logged
    /// and ignored.
    pub fn resolve(&mut self, session_id: &SessionId, ping_id: u64, now: Instant) -> Option<Duration> {
        match self.pending.get(&ping_id) {
            Some(ping) if ping.session_id == *session_id => {}
            Some(ping) => {
                tracing::warn!(
                    %session_id,
                    expected = %ping.session_id,
                    ping_id,
                    "pong from wrong session, ignoring"
                );
                return None;
            }
            None => {
                tracing::warn!(%session_id, ping_id, "pong for unknown ping, ignoring");
                return None;
            }
        }
        let ping = self.pending.remove(&ping_id)?;
        Some(now.saturating_duration_since(ping.sent_at) / 2)
    }

    /// Drops any outstanding probe for `session_id`.
    pub fn forget(&mut self, session_id: &SessionId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, ping| ping.session_id != *session_id);
        before - self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
