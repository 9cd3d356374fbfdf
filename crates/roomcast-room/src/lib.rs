//! Room lifecycle for Roomcast.
//!
//! Each room runs as an isolated Tokio task (actor model) that owns a
//! [`RoomSession`]: the canonical room state, every connected client, the
//! per-player latency estimators, and the worker proxy in front of the
//! server-side simulation.
//!
//! # Key types
//!
//! - [`RoomBuilder`]: configures and starts a room
//! - [`RoomHandle`]: send commands to a running room actor
//! - [`RoomSession`] / [`RoomContext`]: the state machine and what hooks see
//! - [`RoomHooks`]: room-level game logic
//! - [`RoomState`] / [`PlayerState`]: what clients receive
//! - [`RoomConfig`] / [`RoomPhase`]: settings and lifecycle

mod actor;
mod config;
mod error;
mod hooks;
mod session;
mod state;

pub use actor::{RoomBuilder, RoomHandle, RoomInfo};
pub use config::{RoomConfig, RoomPhase, SpawnPoint, clamp_setting};
pub use error::RoomError;
pub use hooks::{DefaultHooks, RoomHooks};
pub use session::{ENGINE_RPC, PlayerSender, RoomContext, RoomEvent, RoomOutbound, RoomSession};
pub use state::{PlayerRole, PlayerState, RoomSettings, RoomState};
