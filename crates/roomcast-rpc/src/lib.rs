//! Request/reply correlation for Roomcast.
//!
//! Any asynchronous channel can carry calls once both ends agree on a
//! correlation id: the caller registers a pending entry, sends the request
//! tagged with the id, and the reader on the other side of the channel
//! settles the entry when the reply with that id comes back.
//!
//! ```text
//! caller ─register()─▶ PendingCalls ◀─settle(reply)─ reply reader
//!    │                      │
//!    └──── await rx ◀───────┘ (oneshot, fires exactly once)
//! ```
//!
//! Every entry is settled exactly once: by its reply, by
//! [`PendingCalls::cancel_all`] when the channel is torn down, or by
//! dropping the table (the receiver then sees [`RpcError::Cancelled`]).

use std::collections::HashMap;

use roomcast_protocol::{BoundaryReply, CorrelationId};
use serde_json::Value;
use tokio::sync::oneshot;

/// Why a correlated call did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The other side answered with an error.
    #[error("{0}")]
    Remote(String),

    /// The call was cancelled before a reply arrived (channel disposed).
    #[error("call cancelled")]
    Cancelled,

    /// The request could not be sent at all.
    #[error("channel closed")]
    Closed,
}

/// The settled value of one call.
pub type CallOutcome = Result<Value, RpcError>;

/// Receiving half of one pending call.
pub type PendingReply = oneshot::Receiver<CallOutcome>;

/// Waits for a pending call to settle.
///
/// A dropped sender (the table went away without settling) reads as
/// [`RpcError::Cancelled`].
pub async fn wait(reply: PendingReply) -> CallOutcome {
    reply.await.unwrap_or(Err(RpcError::Cancelled))
}

/// Table of calls awaiting a reply, keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingCalls {
    next_id: u64,
    pending: HashMap<CorrelationId, oneshot::Sender<CallOutcome>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh id and the receiver its reply will arrive on.
    pub fn register(&mut self) -> (CorrelationId, PendingReply) {
        self.next_id += 1;
        let id = CorrelationId(self.next_id);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        (id, rx)
    }

    /// Settles the call `reply` answers.
    ///
    /// Returns `false` for an unknown or already-settled id; such a reply
    /// is dropped.
    pub fn settle(&mut self, reply: BoundaryReply) -> bool {
        let id = reply.correlation_id;
        let outcome = reply.into_result().map_err(RpcError::Remote);
        self.complete(id, outcome)
    }

    /// Settles `id` with an explicit outcome.
    pub fn complete(&mut self, id: CorrelationId, outcome: CallOutcome) -> bool {
        let Some(tx) = self.pending.remove(&id) else {
            tracing::warn!(correlation_id = %id, "reply for unknown call, dropping");
            return false;
        };
        // The caller may have stopped waiting; the entry is settled either way.
        let _ = tx.send(outcome);
        true
    }

    /// Rejects every pending call with [`RpcError::Cancelled`].
    ///
    /// Returns how many calls were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(RpcError::Cancelled));
        }
        if count > 0 {
            tracing::debug!(count, "cancelled pending calls");
        }
        count
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_register_assigns_fresh_ids() {
        let mut calls = PendingCalls::new();
        let (a, _ra) = calls.register();
        let (b, _rb) = calls.register();
        assert_ne!(a, b);
        assert_eq!(calls.len(), 2);
    }

    #[tokio::test]
    async fn test_settle_success() {
        let mut calls = PendingCalls::new();
        let (id, rx) = calls.register();

        assert!(calls.settle(BoundaryReply::ok(id, json!({ "entities": {} }))));
        assert_eq!(wait(rx).await, Ok(json!({ "entities": {} })));
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn test_settle_error_carries_message() {
        let mut calls = PendingCalls::new();
        let (id, rx) = calls.register();

        calls.settle(BoundaryReply::err(id, "Rpc method not found"));
        assert_eq!(
            wait(rx).await,
            Err(RpcError::Remote("Rpc method not found".into()))
        );
    }

    #[tokio::test]
    async fn test_settle_twice_only_first_counts() {
        let mut calls = PendingCalls::new();
        let (id, rx) = calls.register();

        assert!(calls.settle(BoundaryReply::ok(id, json!(1))));
        assert!(!calls.settle(BoundaryReply::ok(id, json!(2))));
        assert_eq!(wait(rx).await, Ok(json!(1)));
    }

    #[test]
    fn test_settle_unknown_id() {
        let mut calls = PendingCalls::new();
        assert!(!calls.settle(BoundaryReply::ok(CorrelationId(99), json!(null))));
    }

    #[tokio::test]
    async fn test_cancel_all_rejects_everything() {
        let mut calls = PendingCalls::new();
        let (_, a) = calls.register();
        let (_, b) = calls.register();

        assert_eq!(calls.cancel_all(), 2);
        assert_eq!(wait(a).await, Err(RpcError::Cancelled));
        assert_eq!(wait(b).await, Err(RpcError::Cancelled));
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_table_reads_as_cancelled() {
        let mut calls = PendingCalls::new();
        let (_, rx) = calls.register();
        drop(calls);
        assert_eq!(wait(rx).await, Err(RpcError::Cancelled));
    }

    #[tokio::test]
    async fn test_settle_after_caller_gave_up() {
        let mut calls = PendingCalls::new();
        let (id, rx) = calls.register();
        drop(rx);

        assert!(calls.complete(id, Ok(json!(1))));
        assert!(!calls.contains(id));
    }
}
