//! Error types for the worker layer.

use roomcast_rpc::RpcError;
use roomcast_schema::SchemaError;

/// Errors surfaced by [`WorkerProxy`](crate::WorkerProxy).
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The executor thread could not be started.
    #[error("failed to start executor: {0}")]
    Spawn(#[from] std::io::Error),

    /// `LOAD_SPACE` was rejected by the simulation.
    #[error("failed to load game: {0}")]
    Load(RpcError),

    /// `SYNC` was rejected or never acknowledged.
    #[error("failed to sync room state: {0}")]
    Sync(RpcError),

    /// A reply didn't have the expected shape.
    #[error("malformed executor reply: {0}")]
    MalformedReply(#[from] serde_json::Error),

    /// The simulation declared entity kinds that don't compile.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A correlated call failed or was cancelled.
    #[error(transparent)]
    Call(#[from] RpcError),
}
