//! Simulation executor and worker proxy for Roomcast.
//!
//! A room's game code runs behind an isolation boundary, on its own thread
//! or task, and talks to the room only through boundary messages:
//!
//! - [`Simulation`]: the trait server-side game code implements.
//! - [`WorkerProxy`]: the room's handle. It forwards lifecycle events,
//!   makes correlated calls (`LOAD_SPACE`, `SYNC`, `BEFORE_PATCH`,
//!   `RPC_REQUEST`), and relays executor-originated sends to the room.
//! - [`NetStateCache`]: per-record `{version, last raw state}` so a state
//!   pull ships only what changed.
//!
//! Panics inside the simulation are caught at the boundary: the pending
//! call (if any) is rejected with the panic message and an `ERROR` event
//! is reported. A dead executor cancels every pending call.

mod error;
mod host;
mod netstate;
mod proxy;
mod simulation;

pub use error::WorkerError;
pub use netstate::NetStateCache;
pub use proxy::{ExecutorKind, WorkerEvents, WorkerProxy};
pub use simulation::{NetState, ServerApi, SimContext, Simulation};
