//! Per-player connection bookkeeping for Roomcast rooms.
//!
//! This crate handles what a room needs to know about each connection,
//! independent of any game logic:
//!
//! 1. **Latency**: smoothing round-trip samples into latency and jitter
//!    ([`LatencyEstimator`])
//! 2. **Liveness probes**: matching `PONG` replies to the `PING` they
//!    answer ([`PendingPings`])
//! 3. **Reconnection**: letting players resume after a brief disconnect
//!    (token-based, with a grace window) ([`SessionManager`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Room Layer (above)  ← keeps one estimator per player, owns the probe table
//!     ↕
//! Session Layer (this crate)  ← connection identity and quality
//!     ↕
//! Protocol Layer (below)  ← provides SessionId
//! ```

mod error;
mod latency;
mod manager;
mod ping;
mod session;

pub use error::SessionError;
pub use latency::LatencyEstimator;
pub use manager::SessionManager;
pub use ping::{PendingPing, PendingPings};
pub use session::{Session, SessionConfig, SessionState};
