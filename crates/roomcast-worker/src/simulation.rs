//! The `Simulation` trait, the extension point for server-side game code.
//!
//! A simulation lives on the far side of the isolation boundary. The
//! executor host calls these methods as boundary commands arrive; the
//! simulation talks back through the [`ServerApi`] in its [`SimContext`].

use std::time::Duration;

use indexmap::IndexMap;
use roomcast_protocol::{ExecutorEvent, SessionId, SyncParams, Target};
use roomcast_schema::EntityDeclaration;
use serde_json::Value;
use tokio::sync::mpsc;

/// `kind → owner → raw state` as reported by [`Simulation::net_state`].
pub type NetState = IndexMap<String, IndexMap<String, Value>>;

/// Server-side game code.
///
/// Everything runs on the executor: one call at a time, never concurrently
/// with another call on the same simulation. A panic in any method is
/// caught by the host, reported as an `ERROR` event, and (for calls that
/// expect a reply) turned into an error reply. The simulation keeps
/// running afterwards.
pub trait Simulation: Send + 'static {
    /// Loads the game described by `game_data` and declares the entity
    /// kinds it will publish.
    ///
    /// Called exactly once, before anything else. An `Err` aborts room
    /// creation.
    fn load(
        &mut self,
        game_data: &Value,
        ctx: &mut SimContext,
    ) -> Result<IndexMap<String, EntityDeclaration>, String>;

    /// Called after the room handed over its initial state (`ctx.state`
    /// and `ctx.params` are set). Default: no-op.
    fn on_sync(&mut self, _ctx: &mut SimContext) {}

    /// A player joined. Their JSON is already in `ctx.players`.
    fn on_join(&mut self, _session_id: &SessionId, _ctx: &mut SimContext) {}

    /// A player left. Their JSON has already been removed from
    /// `ctx.players` and is passed here.
    fn on_leave(&mut self, _player: &Value, _ctx: &mut SimContext) {}

    /// A player's client-side state changed. `ctx.players` already holds
    /// the merged update.
    fn on_player_state(&mut self, _session_id: &SessionId, _ctx: &mut SimContext) {}

    /// A client game message.
    fn on_message(
        &mut self,
        _message_type: &str,
        _payload: &Value,
        _session_id: &SessionId,
        _ctx: &mut SimContext,
    ) {
    }

    fn start(&mut self, _ctx: &mut SimContext) {}

    fn stop(&mut self, _ctx: &mut SimContext) {}

    /// Advances the simulation by one fixed step of `1 / tickRate`.
    /// Called while the game is running; every state pull first catches
    /// up on the steps that fell due since the last one.
    fn update(&mut self, _dt: Duration, _ctx: &mut SimContext) {}

    /// Current raw state of every published entity.
    ///
    /// Return the full state each time; the host diffs it against the
    /// previous pull and only ships what changed.
    fn net_state(&mut self, ctx: &mut SimContext) -> NetState;

    /// Handles a client RPC routed to the simulation.
    ///
    /// Default: every call fails with `"Rpc method not found"`.
    fn rpc(
        &mut self,
        _request: &Value,
        _session_id: &SessionId,
        _ctx: &mut SimContext,
    ) -> Result<Value, String> {
        Err("Rpc method not found".into())
    }

    /// Called once when the room is torn down.
    fn dispose(&mut self, _ctx: &mut SimContext) {}
}

/// What a simulation sees of the room.
#[derive(Debug)]
pub struct SimContext {
    /// Room state as handed over on `SYNC`.
    pub state: Value,
    /// Room parameters, set on `SYNC`.
    pub params: Option<SyncParams>,
    /// The executor's copy of every player, keyed by session id.
    ///
    /// Writes here are picked up by the next state pull and patched into
    /// the room's player state.
    pub players: IndexMap<SessionId, Value>,
    /// Outbound channel to the room.
    pub api: ServerApi,
}

impl SimContext {
    pub(crate) fn new(api: ServerApi) -> Self {
        Self {
            state: Value::Null,
            params: None,
            players: IndexMap::new(),
            api,
        }
    }

    /// Whether the room owns player transforms.
    pub fn authoritative_position(&self) -> bool {
        self.params.is_some_and(|p| p.authoritative_position)
    }
}

/// Handle a simulation uses to reach clients through the room.
///
/// Cloneable; every clone feeds the same event channel. Sends after the
/// room is gone are silently dropped.
#[derive(Debug, Clone)]
pub struct ServerApi {
    events: mpsc::UnboundedSender<ExecutorEvent>,
}

impl ServerApi {
    pub(crate) fn new(events: mpsc::UnboundedSender<ExecutorEvent>) -> Self {
        Self { events }
    }

    /// Sends a message to one player.
    pub fn send(&self, message_type: impl Into<String>, data: Value, session_id: SessionId) {
        self.emit(ExecutorEvent::Send {
            message_type: message_type.into(),
            data,
            target: Target::Session(session_id),
        });
    }

    /// Sends a message to every player except `exclude`.
    pub fn broadcast(&self, message_type: impl Into<String>, data: Value, exclude: Vec<SessionId>) {
        self.emit(ExecutorEvent::Send {
            message_type: message_type.into(),
            data,
            target: Target::Broadcast { exclude },
        });
    }

    /// Asks the room to disconnect a player.
    pub fn disconnect_player(&self, session_id: SessionId) {
        self.emit(ExecutorEvent::Disconnect { session_id });
    }

    pub(crate) fn emit(&self, event: ExecutorEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("room gone, dropping executor event");
        }
    }
}
