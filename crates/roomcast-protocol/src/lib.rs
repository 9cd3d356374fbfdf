//! Wire protocol for Roomcast.
//!
//! This crate defines the two "languages" a room speaks:
//!
//! - **Client protocol** ([`ClientMessage`], [`ServerMessage`]): JSON
//!   frames exchanged with browser clients.
//! - **Boundary protocol** ([`BoundaryEnvelope`], [`ExecutorCommand`],
//!   [`ExecutorEvent`]): messages exchanged with the isolated simulation
//!   executor, with optional correlation ids for request/reply.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how messages become bytes.
//! - **Errors** ([`ProtocolError`]).
//!
//! # Architecture
//!
//! ```text
//! Transport (bytes) → Protocol (ClientMessage) → Room session
//!                                                    │
//!                                   BoundaryEnvelope ▼ ExecutorEvent
//!                                                 Executor
//! ```

mod boundary;
mod codec;
mod error;
mod types;

pub use boundary::{
    BoundaryEnvelope, BoundaryReply, EntityDelta, EntityDeltaBatch, ExecutorCommand,
    ExecutorEvent, SpaceLoaded, SyncParams, Target,
};
pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use types::{
    ClientMessage, CorrelationId, GameAction, PlayerStateFrame, ServerMessage, SessionId, Vec3,
};
