//! # Roomcast
//!
//! A real-time multiplayer room server. One process hosts one room:
//! browser clients connect over WebSocket, the room keeps the canonical
//! state and streams patches back, and an optional server-side
//! [`Simulation`] runs behind an isolation boundary.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use roomcast::prelude::*;
//!
//! # async fn run(game_data: serde_json::Value) -> Result<(), RoomcastError> {
//! roomcast::init_tracing();
//! let server = RoomcastServer::builder(ServerConfig::from_env())
//!     .room(RoomBuilder::new("main", game_data))
//!     .build()
//!     .await?;
//! server.run().await
//! # }
//! ```
//!
//! [`Simulation`]: roomcast_worker::Simulation

mod config;
mod error;
mod handler;
mod server;

pub use config::{BIND_ENV, IDLE_TIMEOUT_ENV, ServerConfig};
pub use error::RoomcastError;
pub use server::{RoomcastServer, RoomcastServerBuilder};

/// Installs a `tracing` subscriber filtered by `RUST_LOG`, falling back to
/// `roomcast=info`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("roomcast=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub mod prelude {
    pub use crate::{RoomcastError, RoomcastServer, RoomcastServerBuilder, ServerConfig};
    pub use roomcast_protocol::{ClientMessage, GameAction, PlayerStateFrame, ServerMessage, SessionId, Vec3};
    pub use roomcast_room::{
        RoomBuilder, RoomConfig, RoomContext, RoomError, RoomEvent, RoomHandle, RoomHooks, RoomPhase,
    };
    pub use roomcast_schema::EntityDeclaration;
    pub use roomcast_worker::{ExecutorKind, NetState, SimContext, Simulation};
}
