//! The game-facing extension points of a room.

use std::time::Duration;

use roomcast_protocol::SessionId;
use serde_json::Value;

use crate::config::clamp_setting;
use crate::{PlayerState, RoomContext, RoomError};

/// Longest countdown a client may ask for, in seconds.
const MAX_COUNTDOWN_SECS: f64 = 3600.0;

/// Room-level game logic.
///
/// Every method has a default, so a room with no custom behavior uses
/// [`DefaultHooks`]. All calls happen on the room's event loop, one at a
/// time, with the room's [`RoomContext`] to read state and act on it.
///
/// Server-side simulations that need isolation implement
/// `roomcast_worker::Simulation` instead; the two can be combined.
pub trait RoomHooks: Send + 'static {
    /// The room's state exists and the executor (if any) is loaded.
    fn on_create(&mut self, _ctx: &mut RoomContext) -> Result<(), RoomError> {
        Ok(())
    }

    fn on_join(&mut self, _session_id: &SessionId, _ctx: &mut RoomContext) {}

    /// `player` has already been removed from the room state.
    fn on_leave(&mut self, _player: &PlayerState, _ctx: &mut RoomContext) {}

    fn on_player_state(&mut self, _session_id: &SessionId, _ctx: &mut RoomContext) {}

    /// A `GAME_MESSAGE` arrived. The default relays `broadcast`/`send`
    /// payloads to other players.
    ///
    /// An error is reported back to the sender.
    fn on_message(&mut self, message: &Value, sender: &SessionId, ctx: &mut RoomContext) -> Result<(), RoomError> {
        ctx.relay_message(message, sender)
    }

    /// A client asked to start the game. The default starts it with the
    /// requested `countdown` in seconds.
    fn on_request_start(&mut self, data: &Value, _sender: &SessionId, ctx: &mut RoomContext) -> Result<(), RoomError> {
        let countdown = clamp_setting(data.get("countdown"), 0.0, 0.0, MAX_COUNTDOWN_SECS);
        ctx.start_game(Duration::from_secs_f64(countdown))
    }

    /// A client asked to stop the game.
    fn on_request_stop(&mut self, _sender: &SessionId, ctx: &mut RoomContext) -> Result<(), RoomError> {
        ctx.stop_game()
    }

    /// A client RPC that isn't routed to the simulation.
    ///
    /// Return `None` when no handler exists for `rpc_id`.
    fn on_rpc(
        &mut self,
        _rpc_id: &str,
        _data: &Value,
        _sender: &SessionId,
        _ctx: &mut RoomContext,
    ) -> Option<Result<Value, String>> {
        None
    }

    /// Called every simulation tick while the game is running.
    fn on_update(&mut self, _dt: Duration, _ctx: &mut RoomContext) {}

    /// The room is shutting down. Timers and the executor are already gone.
    fn on_dispose(&mut self, _ctx: &mut RoomContext) {}
}

/// Hooks that keep every default.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl RoomHooks for DefaultHooks {}
