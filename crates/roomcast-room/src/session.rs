//! The room session state machine.
//!
//! [`RoomSession`] owns everything about one room: the canonical
//! [`RoomState`], connected clients, per-player latency, timers, and the
//! worker proxy. It is driven by the room actor, one event at a time:
//!
//! ```text
//! client frames ─┐
//! timers ────────┼──▶ RoomSession ──▶ RoomState ──PATCH──▶ clients
//! executor ──────┘        │
//!                         └──notifications / calls──▶ WorkerProxy
//! ```
//!
//! Timers never touch the session directly. They post a [`Wakeup`] to the
//! actor's queue, and each wakeup carries an epoch so a timer that lost a
//! race (a reconnect that beat its timeout, a countdown that was stopped)
//! does nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use roomcast_protocol::{
    ClientMessage, ExecutorEvent, GameAction, PlayerStateFrame, ServerMessage, SessionId, SyncParams, Target,
};
use roomcast_schema::{EntityDeclaration, EntityRegistry};
use roomcast_session::{LatencyEstimator, PendingPings};
use roomcast_tick::{Cadence, DelayedTask, RepeatingTask};
use roomcast_worker::{WorkerError, WorkerEvents, WorkerProxy};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use crate::state::{PlayerRole, RoomSettings};
use crate::{PlayerState, RoomConfig, RoomError, RoomHooks, RoomPhase, RoomState};

/// RPC route served by the server-side simulation.
pub const ENGINE_RPC: &str = "@@engine";

/// An outbound frame from the room to one client connection.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomOutbound {
    Message(ServerMessage),
    /// The room dropped this player; close the connection.
    Close,
}

/// Channel sender for delivering outbound frames to a player.
pub type PlayerSender = mpsc::UnboundedSender<RoomOutbound>;

/// Lifecycle notifications for anyone watching the room.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Joined { session_id: SessionId },
    Left { session_id: SessionId },
    Started,
    Stopped,
    Disposed,
}

/// Deferred work posted to the room's own queue.
#[derive(Debug)]
pub(crate) enum Wakeup {
    /// Time to probe this player.
    Ping(SessionId),
    CountdownElapsed { epoch: u64 },
    ReconnectExpired { session_id: SessionId, epoch: u64 },
    /// An engine RPC came back from the executor.
    RpcSettled {
        session_id: SessionId,
        rpc_id: String,
        msg_id: Option<String>,
        outcome: Result<Value, WorkerError>,
    },
    /// Drop a player without a reconnect window.
    Kick(SessionId),
}

/// Starts the executor; supplied by the room builder.
pub(crate) type SpawnWorker = Box<dyn FnOnce() -> Result<(WorkerProxy, WorkerEvents), WorkerError> + Send>;

/// Everything needed to create a session.
pub(crate) struct RoomSetup {
    pub room_id: String,
    pub game_data: Value,
    pub hooks: Box<dyn RoomHooks>,
    pub declared: IndexMap<String, EntityDeclaration>,
    pub worker: Option<SpawnWorker>,
    pub events: broadcast::Sender<RoomEvent>,
    pub connected: watch::Sender<usize>,
    pub wakeups: mpsc::UnboundedSender<Wakeup>,
}

// ---------------------------------------------------------------------------
// RoomContext
// ---------------------------------------------------------------------------

/// The room as [`RoomHooks`] see it.
pub struct RoomContext {
    room_id: String,
    config: RoomConfig,
    state: RoomState,
    phase: RoomPhase,
    disposed: bool,
    clients: HashMap<SessionId, PlayerSender>,
    latency: HashMap<SessionId, LatencyEstimator>,
    pings: PendingPings,
    ping_cadence: Cadence,
    ping_tasks: HashMap<SessionId, RepeatingTask>,
    countdown: Option<DelayedTask>,
    countdown_epoch: u64,
    reconnects: HashMap<SessionId, (u64, DelayedTask)>,
    reconnect_epoch: u64,
    proxy: Option<WorkerProxy>,
    events: broadcast::Sender<RoomEvent>,
    connected: watch::Sender<usize>,
    wakeups: mpsc::UnboundedSender<Wakeup>,
}

impl RoomContext {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn state(&self) -> &RoomState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut RoomState {
        &mut self.state
    }

    pub fn player(&self, session_id: &SessionId) -> Option<&PlayerState> {
        self.state.player(session_id)
    }

    /// The current host, if anyone is in the room.
    pub fn host(&self) -> Option<&SessionId> {
        self.state
            .players()
            .values()
            .find(|p| p.is_host())
            .map(|p| &p.session_id)
    }

    /// Players with a live connection.
    pub fn connected_count(&self) -> usize {
        self.clients.len()
    }

    pub fn latency(&self, session_id: &SessionId) -> Option<&LatencyEstimator> {
        self.latency.get(session_id)
    }

    /// Whether a server-side simulation is attached.
    pub fn has_engine(&self) -> bool {
        self.proxy.is_some()
    }

    // -- Sending ---------------------------------------------------------

    /// Sends to one player. Silently drops if they have no connection.
    pub fn send_to(&self, session_id: &SessionId, msg: ServerMessage) {
        if let Some(sender) = self.clients.get(session_id) {
            let _ = sender.send(RoomOutbound::Message(msg));
        }
    }

    pub fn broadcast(&self, msg: ServerMessage) {
        self.broadcast_except(msg, &[]);
    }

    pub fn broadcast_except(&self, msg: ServerMessage, exclude: &[SessionId]) {
        for (session_id, sender) in &self.clients {
            if !exclude.contains(session_id) {
                let _ = sender.send(RoomOutbound::Message(msg.clone()));
            }
        }
    }

    /// Relays a `GAME_MESSAGE` between players.
    ///
    /// - `{type:"broadcast", exclude?, ...}` goes to everyone not in
    ///   `exclude` as `ROOM_MESSAGE`, minus the `exclude` key.
    /// - `{type:"send", playerId, data}` goes to `playerId` only.
    ///
    /// Anything else is left to the simulation.
    ///
    /// # Errors
    /// [`RoomError::InvalidMessage`] if `exclude` isn't a list of strings.
    pub fn relay_message(&mut self, message: &Value, sender: &SessionId) -> Result<(), RoomError> {
        match message.get("type").and_then(Value::as_str) {
            Some("broadcast") => {
                let exclude = match message.get("exclude") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|item| item.as_str().map(SessionId::from))
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| malformed_exclude(&self.room_id, sender))?,
                    Some(_) => return Err(malformed_exclude(&self.room_id, sender)),
                };
                let mut data = message.clone();
                if let Some(fields) = data.as_object_mut() {
                    fields.remove("exclude");
                }
                tracing::debug!(room_id = %self.room_id, %sender, excluded = exclude.len(), "relaying broadcast");
                self.broadcast_except(ServerMessage::RoomMessage { data }, &exclude);
            }
            Some("send") => {
                let Some(target) = message.get("playerId").and_then(Value::as_str).map(SessionId::from) else {
                    tracing::warn!(room_id = %self.room_id, %sender, "send without playerId, dropping");
                    return Ok(());
                };
                if self.state.player(&target).is_none() {
                    tracing::warn!(room_id = %self.room_id, %sender, %target, "send to unknown player, dropping");
                    return Ok(());
                }
                let data = message.get("data").cloned().unwrap_or(Value::Null);
                self.send_to(&target, ServerMessage::RoomMessage { data });
            }
            _ => {}
        }
        Ok(())
    }

    // -- Lifecycle -------------------------------------------------------

    /// Starts the game after `countdown`.
    ///
    /// Every connected player is told right away how long to wait, less
    /// their own latency, so they all reach zero together. After the full
    /// countdown the room is running and the simulation starts.
    ///
    /// # Errors
    /// [`RoomError::AlreadyStarted`] during a countdown or game.
    pub fn start_game(&mut self, countdown: Duration) -> Result<(), RoomError> {
        if self.disposed {
            return Err(RoomError::Unavailable(self.room_id.clone()));
        }
        if self.phase.is_started() {
            return Err(RoomError::AlreadyStarted);
        }
        if !self.phase.can_start() {
            return Err(RoomError::InvalidState(format!("cannot start in phase {}", self.phase)));
        }

        self.phase = RoomPhase::Countdown;
        let countdown_ms = countdown.as_secs_f64() * 1000.0;
        for (session_id, player) in self.state.players() {
            let delay_ms = (countdown_ms - player.latency).max(0.0);
            self.send_to(
                session_id,
                ServerMessage::RoomGameAction {
                    action: GameAction::Start,
                    data: Some(delay_ms / 1000.0),
                },
            );
        }
        tracing::info!(room_id = %self.room_id, countdown_ms, "countdown started");

        self.countdown_epoch += 1;
        if countdown.is_zero() {
            self.enter_running();
        } else {
            let epoch = self.countdown_epoch;
            let wakeups = self.wakeups.clone();
            self.countdown = Some(DelayedTask::spawn(countdown, move || {
                let _ = wakeups.send(Wakeup::CountdownElapsed { epoch });
            }));
        }
        Ok(())
    }

    /// Stops a running game or cancels a countdown.
    ///
    /// # Errors
    /// [`RoomError::InvalidState`] if no game was started.
    pub fn stop_game(&mut self) -> Result<(), RoomError> {
        if !self.phase.is_started() {
            return Err(RoomError::InvalidState(format!("cannot stop in phase {}", self.phase)));
        }
        let was_running = self.phase == RoomPhase::Running;
        self.countdown = None;
        self.countdown_epoch += 1;
        self.phase = RoomPhase::Stopped;
        self.ping_cadence.set(RoomConfig::IDLE_PING_INTERVAL);

        self.broadcast(ServerMessage::RoomGameAction {
            action: GameAction::Stop,
            data: None,
        });
        if was_running {
            if let Some(proxy) = &self.proxy {
                proxy.stop_game();
            }
        }
        let _ = self.events.send(RoomEvent::Stopped);
        tracing::info!(room_id = %self.room_id, "game stopped");
        Ok(())
    }

    /// Drops a player at the end of the current event, without a
    /// reconnect window.
    pub fn disconnect_player(&self, session_id: &SessionId) {
        let _ = self.wakeups.send(Wakeup::Kick(session_id.clone()));
    }

    fn enter_running(&mut self) {
        self.countdown = None;
        self.phase = RoomPhase::Running;
        self.ping_cadence.set(self.config.ping_interval);
        if let Some(proxy) = &self.proxy {
            proxy.start_game();
        }
        let _ = self.events.send(RoomEvent::Started);
        tracing::info!(room_id = %self.room_id, players = self.state.player_count(), "game started");
    }

    // -- Membership ------------------------------------------------------

    fn admit(&mut self, session_id: SessionId, options: &Value, sender: PlayerSender) -> Result<(), RoomError> {
        if self.disposed {
            return Err(RoomError::Unavailable(self.room_id.clone()));
        }
        if self.state.player(&session_id).is_some() {
            return Err(RoomError::AlreadyJoined(session_id));
        }
        if self.phase.is_started() && !self.config.join_after_start {
            return Err(RoomError::AlreadyStarted);
        }
        let current = self.state.player_count();
        if current >= self.config.max_players {
            return Err(RoomError::RoomFull {
                current,
                max: self.config.max_players,
            });
        }

        let mut player = PlayerState::from_options(session_id.clone(), options);
        if current == 0 {
            player.role = PlayerRole::Host;
        }
        if self.config.authoritative_position {
            if let Some(spawn) = self.config.spawn {
                player.position = spawn.position;
                player.rotation = spawn.rotation;
            }
        }
        let player_json = player.to_json();
        self.state.add_player(player);
        self.clients.insert(session_id.clone(), sender);
        self.latency
            .insert(session_id.clone(), LatencyEstimator::new(self.config.latency_window));

        tracing::info!(
            room_id = %self.room_id,
            %session_id,
            players = self.state.player_count(),
            host = current == 0,
            "player joined"
        );
        let _ = self.events.send(RoomEvent::Joined {
            session_id: session_id.clone(),
        });
        if let Some(proxy) = &self.proxy {
            proxy.on_join(player_json);
        }
        self.start_probing(&session_id);
        self.publish_connected();
        Ok(())
    }

    fn release(&mut self, session_id: &SessionId) -> Result<PlayerState, RoomError> {
        let player = self
            .state
            .remove_player(session_id)
            .ok_or_else(|| RoomError::PlayerNotFound(session_id.clone()))?;
        self.clients.remove(session_id);
        self.reconnects.remove(session_id);

        if player.is_host() {
            // Join order decides; clients see the new role in the next patch.
            let next = self.state.players().keys().next().cloned();
            if let Some(next) = next {
                self.state.update_player(&next, |p| {
                    p.role = PlayerRole::Host;
                    true
                });
                tracing::info!(room_id = %self.room_id, host = %next, "host reassigned");
            }
        }

        self.stop_probing(session_id);
        self.latency.remove(session_id);
        if let Some(proxy) = &self.proxy {
            proxy.on_leave(player.to_json());
        }

        tracing::info!(
            room_id = %self.room_id,
            %session_id,
            players = self.state.player_count(),
            "player left"
        );
        let _ = self.events.send(RoomEvent::Left {
            session_id: session_id.clone(),
        });
        self.publish_connected();
        Ok(player)
    }

    fn publish_connected(&self) {
        self.connected.send_replace(self.clients.len());
    }

    // -- Probing ---------------------------------------------------------

    fn start_probing(&mut self, session_id: &SessionId) {
        let wakeups = self.wakeups.clone();
        let target = session_id.clone();
        let task = RepeatingTask::spawn(self.ping_cadence.clone(), move || {
            wakeups.send(Wakeup::Ping(target.clone())).is_ok()
        });
        self.ping_tasks.insert(session_id.clone(), task);
    }

    fn stop_probing(&mut self, session_id: &SessionId) {
        self.ping_tasks.remove(session_id);
        self.pings.forget(session_id);
    }

    fn send_ping(&mut self, session_id: &SessionId) {
        if !self.clients.contains_key(session_id) {
            return;
        }
        let ping_id = self.pings.issue(session_id, Instant::now());
        tracing::trace!(room_id = %self.room_id, %session_id, ping_id, "ping");
        self.send_to(session_id, ServerMessage::Ping { data: ping_id });
    }

    fn record_pong(&mut self, session_id: &SessionId, ping_id: u64) {
        let Some(one_way) = self.pings.resolve(session_id, ping_id, Instant::now()) else {
            return;
        };
        let Some(estimator) = self.latency.get_mut(session_id) else {
            return;
        };
        estimator.record(one_way.as_secs_f64() * 1000.0);
        let (latency, jitter) = (estimator.latency(), estimator.jitter());
        self.state.update_player(session_id, |p| {
            let changed = p.latency != latency || p.jitter != jitter;
            p.latency = latency;
            p.jitter = jitter;
            changed
        });
    }

    fn sync_params(&self) -> SyncParams {
        SyncParams {
            authoritative_position: self.config.authoritative_position,
            max_players: self.config.max_players,
            tick_rate: self.config.tick_rate,
            patch_rate: self.config.patch_rate,
        }
    }
}

fn malformed_exclude(room_id: &str, sender: &SessionId) -> RoomError {
    tracing::warn!(room_id, %sender, "malformed exclude list, dropping broadcast");
    RoomError::InvalidMessage("exclude must be a list of session ids".into())
}

// ---------------------------------------------------------------------------
// RoomSession
// ---------------------------------------------------------------------------

/// One room's state machine: the context plus the hooks that customize it.
pub struct RoomSession {
    ctx: RoomContext,
    hooks: Box<dyn RoomHooks>,
}

impl RoomSession {
    /// Creates the room.
    ///
    /// Clamps the config, starts and loads the executor when a simulation
    /// is attached and `serverEngine` is on, builds the state from every
    /// declared kind, runs `on_create`, and finally syncs the executor.
    /// Any failure aborts creation; the executor is disposed with the
    /// half-built session.
    pub(crate) async fn create(setup: RoomSetup) -> Result<(Self, Option<WorkerEvents>), RoomError> {
        let RoomSetup {
            room_id,
            game_data,
            hooks,
            declared,
            worker,
            events,
            connected,
            wakeups,
        } = setup;
        let config = RoomConfig::from_game_data(&game_data);

        let mut registry = EntityRegistry::new();
        registry.register_all(declared.iter().map(|(kind, decl)| (kind.as_str(), decl)))?;

        let (proxy, worker_events) = match worker {
            Some(spawn) if config.server_engine => {
                let (proxy, worker_events) = spawn()?;
                let loaded = proxy.init(game_data).await?;
                for kind in loaded.kinds() {
                    if let Some(ty) = loaded.get(kind) {
                        registry.register(kind, ty.declaration())?;
                    }
                }
                (Some(proxy), Some(worker_events))
            }
            Some(_) => {
                tracing::info!(%room_id, "server engine disabled, simulation not started");
                (None, None)
            }
            None => (None, None),
        };

        let state = RoomState::new(RoomSettings::from(&config), Arc::new(registry));
        let ping_cadence = Cadence::new(RoomConfig::IDLE_PING_INTERVAL);
        let mut session = Self {
            ctx: RoomContext {
                room_id,
                config,
                state,
                phase: RoomPhase::Created,
                disposed: false,
                clients: HashMap::new(),
                latency: HashMap::new(),
                pings: PendingPings::new(),
                ping_cadence,
                ping_tasks: HashMap::new(),
                countdown: None,
                countdown_epoch: 0,
                reconnects: HashMap::new(),
                reconnect_epoch: 0,
                proxy,
                events,
                connected,
                wakeups,
            },
            hooks,
        };

        session.hooks.on_create(&mut session.ctx)?;
        if let Some(proxy) = &session.ctx.proxy {
            proxy.sync(session.ctx.state.to_json(), session.ctx.sync_params()).await?;
        }
        session.ctx.phase = RoomPhase::Idle;
        tracing::info!(
            room_id = %session.ctx.room_id,
            kinds = session.ctx.state.registered_kinds().len(),
            engine = session.ctx.has_engine(),
            "room created"
        );
        Ok((session, worker_events))
    }

    pub fn context(&self) -> &RoomContext {
        &self.ctx
    }

    pub fn phase(&self) -> RoomPhase {
        self.ctx.phase
    }

    /// Adds a player and returns the full room snapshot for them.
    ///
    /// # Errors
    /// - [`RoomError::AlreadyStarted`] if the game is underway and late
    ///   joins are off.
    /// - [`RoomError::RoomFull`] at capacity.
    pub fn join(&mut self, session_id: SessionId, options: &Value, sender: PlayerSender) -> Result<Value, RoomError> {
        self.ctx.admit(session_id.clone(), options, sender)?;
        self.hooks.on_join(&session_id, &mut self.ctx);
        if self.ctx.config.auto_start && self.ctx.phase.can_start() {
            if let Err(e) = self.ctx.start_game(Duration::ZERO) {
                tracing::warn!(room_id = %self.ctx.room_id, error = %e, "auto start failed");
            }
        }
        Ok(self.ctx.state.to_json())
    }

    /// Removes a player for good.
    pub fn leave(&mut self, session_id: &SessionId) -> Result<PlayerState, RoomError> {
        let player = self.ctx.release(session_id)?;
        self.hooks.on_leave(&player, &mut self.ctx);
        Ok(player)
    }

    /// A player's connection dropped. Returns the reconnect grace.
    ///
    /// With a consented close or a zero grace the player leaves right away
    /// and the grace is zero. Otherwise they stay in the room, marked
    /// disconnected, until they reconnect or the grace runs out.
    pub fn disconnect(&mut self, session_id: &SessionId, consented: bool) -> Result<Duration, RoomError> {
        let connected = self
            .ctx
            .player(session_id)
            .map(|p| p.connected)
            .ok_or_else(|| RoomError::PlayerNotFound(session_id.clone()))?;
        if !connected {
            return Err(RoomError::InvalidState(format!("player {session_id} is already disconnected")));
        }

        let grace = if consented {
            Duration::ZERO
        } else {
            self.ctx.config.reconnect_timeout
        };
        if grace.is_zero() {
            self.leave(session_id)?;
            return Ok(Duration::ZERO);
        }

        self.ctx.clients.remove(session_id);
        self.ctx.state.set_connected(session_id, false);
        self.ctx.stop_probing(session_id);
        self.ctx.reconnect_epoch += 1;
        let epoch = self.ctx.reconnect_epoch;
        let wakeups = self.ctx.wakeups.clone();
        let expired = session_id.clone();
        let timer = DelayedTask::spawn(grace, move || {
            let _ = wakeups.send(Wakeup::ReconnectExpired {
                session_id: expired,
                epoch,
            });
        });
        self.ctx.reconnects.insert(session_id.clone(), (epoch, timer));
        self.ctx.publish_connected();
        tracing::info!(room_id = %self.ctx.room_id, %session_id, grace_ms = grace.as_millis() as u64, "player disconnected");
        Ok(grace)
    }

    /// Re-attaches a connection inside the grace window. Returns the full
    /// room snapshot.
    ///
    /// # Errors
    /// [`RoomError::PlayerNotFound`] once the window has closed.
    pub fn reconnect(&mut self, session_id: &SessionId, sender: PlayerSender) -> Result<Value, RoomError> {
        let connected = self
            .ctx
            .player(session_id)
            .map(|p| p.connected)
            .ok_or_else(|| RoomError::PlayerNotFound(session_id.clone()))?;
        if connected {
            return Err(RoomError::AlreadyJoined(session_id.clone()));
        }

        self.ctx.reconnects.remove(session_id);
        self.ctx.state.set_connected(session_id, true);
        self.ctx.clients.insert(session_id.clone(), sender);
        self.ctx.start_probing(session_id);
        self.ctx.publish_connected();
        tracing::info!(room_id = %self.ctx.room_id, %session_id, "player reconnected");
        Ok(self.ctx.state.to_json())
    }

    pub fn start_game(&mut self, countdown: Duration) -> Result<(), RoomError> {
        self.ctx.start_game(countdown)
    }

    pub fn stop_game(&mut self) -> Result<(), RoomError> {
        self.ctx.stop_game()
    }

    /// Routes one client frame.
    pub fn dispatch(&mut self, session_id: &SessionId, msg: ClientMessage) {
        if self.ctx.player(session_id).is_none() {
            tracing::warn!(room_id = %self.ctx.room_id, %session_id, kind = msg.kind(), "message from non-member, ignoring");
            return;
        }
        tracing::debug!(room_id = %self.ctx.room_id, %session_id, kind = msg.kind(), "dispatch");

        match msg {
            ClientMessage::PlayerState { data } => self.handle_player_state(session_id, data),
            ClientMessage::GameMessage { data } => {
                if let Err(e) = self.hooks.on_message(&data, session_id, &mut self.ctx) {
                    self.ctx.send_to(session_id, ServerMessage::from(&e));
                }
                if let Some(proxy) = &self.ctx.proxy {
                    let message_type = data.get("type").and_then(Value::as_str).unwrap_or("message").to_string();
                    proxy.on_message(message_type, data, session_id.clone());
                }
            }
            ClientMessage::GameRequest { action, data } => {
                let result = match action {
                    GameAction::Start => self.hooks.on_request_start(&data, session_id, &mut self.ctx),
                    GameAction::Stop => self.hooks.on_request_stop(session_id, &mut self.ctx),
                };
                if let Err(e) = result {
                    tracing::debug!(room_id = %self.ctx.room_id, %session_id, error = %e, "game request rejected");
                    self.ctx.send_to(session_id, ServerMessage::from(&e));
                }
            }
            ClientMessage::Rpc { rpc_id, data, msg_id } => self.handle_rpc(session_id, rpc_id, data, msg_id),
            ClientMessage::Ping { data } => self.ctx.send_to(session_id, ServerMessage::Pong { data }),
            ClientMessage::Pong { data } => self.ctx.record_pong(session_id, data),
            ClientMessage::Join { .. } => {
                tracing::warn!(room_id = %self.ctx.room_id, %session_id, "JOIN after handshake, ignoring");
            }
        }
    }

    fn handle_player_state(&mut self, session_id: &SessionId, frame: PlayerStateFrame) {
        let authoritative = self.ctx.config.authoritative_position;
        self.ctx
            .state
            .update_player(session_id, |p| p.apply_frame(&frame, authoritative));

        if let Some(proxy) = &self.ctx.proxy {
            proxy.on_player_state(json!({
                "sessionId": session_id,
                "position": frame.position,
                "rotation": frame.rotation,
                "animation": frame.animation,
                "scale": frame.scale,
                "vrmUrl": frame.vrm_url,
                "text": frame.text,
                "input": frame.input,
            }));
        }
        self.hooks.on_player_state(session_id, &mut self.ctx);
    }

    fn handle_rpc(&mut self, session_id: &SessionId, rpc_id: String, data: Value, msg_id: Option<String>) {
        if rpc_id == ENGINE_RPC {
            let Some(proxy) = &self.ctx.proxy else {
                tracing::warn!(room_id = %self.ctx.room_id, %session_id, "engine rpc without a simulation");
                self.reply_rpc(session_id, rpc_id, msg_id, Err("No server engine".into()));
                return;
            };
            let call = proxy.rpc(data, session_id.clone());
            let wakeups = self.ctx.wakeups.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                let outcome = call.await;
                let _ = wakeups.send(Wakeup::RpcSettled {
                    session_id,
                    rpc_id,
                    msg_id,
                    outcome,
                });
            });
            return;
        }

        match self.hooks.on_rpc(&rpc_id, &data, session_id, &mut self.ctx) {
            Some(result) => self.reply_rpc(session_id, rpc_id, msg_id, result),
            None => {
                tracing::warn!(room_id = %self.ctx.room_id, %session_id, %rpc_id, "no handler for rpc");
                self.reply_rpc(session_id, rpc_id, msg_id, Err("Rpc method not found".into()));
            }
        }
    }

    /// Answers an RPC. Calls without a `msgId` get no reply.
    fn reply_rpc(&self, session_id: &SessionId, rpc_id: String, msg_id: Option<String>, result: Result<Value, String>) {
        if msg_id.is_none() {
            return;
        }
        let data = match result {
            Ok(value) => json!({ "value": value }),
            Err(error) => json!({ "error": error }),
        };
        self.ctx.send_to(session_id, ServerMessage::Rpc { rpc_id, msg_id, data });
    }

    /// Handles deferred work from the room's own queue.
    pub(crate) fn handle_wakeup(&mut self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Ping(session_id) => self.ctx.send_ping(&session_id),
            Wakeup::CountdownElapsed { epoch } => {
                if epoch == self.ctx.countdown_epoch && self.ctx.phase == RoomPhase::Countdown {
                    self.ctx.enter_running();
                }
            }
            Wakeup::ReconnectExpired { session_id, epoch } => {
                let current = self.ctx.reconnects.get(&session_id).map(|(e, _)| *e);
                if current != Some(epoch) {
                    tracing::debug!(room_id = %self.ctx.room_id, %session_id, "stale reconnect timeout, ignoring");
                    return;
                }
                tracing::info!(room_id = %self.ctx.room_id, %session_id, "reconnect window closed");
                if let Err(e) = self.leave(&session_id) {
                    tracing::warn!(room_id = %self.ctx.room_id, %session_id, error = %e, "leave after timeout failed");
                }
            }
            Wakeup::RpcSettled {
                session_id,
                rpc_id,
                msg_id,
                outcome,
            } => {
                self.reply_rpc(&session_id, rpc_id, msg_id, outcome.map_err(|e| e.to_string()));
            }
            Wakeup::Kick(session_id) => self.kick(&session_id),
        }
    }

    /// Handles a relayed executor event.
    pub(crate) fn handle_worker_event(&mut self, event: ExecutorEvent) {
        match event {
            ExecutorEvent::Send {
                message_type,
                data,
                target,
            } => {
                let msg = ServerMessage::GameEvent {
                    name: message_type,
                    data,
                };
                match target {
                    Target::Broadcast { exclude } => self.ctx.broadcast_except(msg, &exclude),
                    Target::Session(session_id) if self.ctx.clients.contains_key(&session_id) => {
                        self.ctx.send_to(&session_id, msg);
                    }
                    Target::Session(session_id) => {
                        tracing::warn!(room_id = %self.ctx.room_id, %session_id, "simulation send to unknown player, dropping");
                    }
                }
            }
            ExecutorEvent::Disconnect { session_id } => self.kick(&session_id),
            ExecutorEvent::Error { message } => {
                tracing::warn!(room_id = %self.ctx.room_id, %message, "simulation reported an error");
            }
            ExecutorEvent::Reply(reply) => {
                tracing::debug!(room_id = %self.ctx.room_id, correlation_id = %reply.correlation_id, "stray reply, ignoring");
            }
        }
    }

    fn kick(&mut self, session_id: &SessionId) {
        if let Some(sender) = self.ctx.clients.get(session_id) {
            let _ = sender.send(RoomOutbound::Close);
        }
        match self.leave(session_id) {
            Ok(_) => tracing::info!(room_id = %self.ctx.room_id, %session_id, "player disconnected by server"),
            Err(e) => tracing::debug!(room_id = %self.ctx.room_id, %session_id, error = %e, "kick for absent player"),
        }
    }

    /// One simulation tick while running.
    pub(crate) fn update(&mut self, dt: Duration) {
        if self.ctx.phase == RoomPhase::Running {
            self.hooks.on_update(dt, &mut self.ctx);
        }
    }

    /// Stamps a new snapshot, pulls executor changes into the room state
    /// and sends the patch.
    ///
    /// Nothing is sent when nothing changed.
    pub async fn before_patch(&mut self) {
        if self.ctx.disposed {
            return;
        }
        self.ctx.state.begin_snapshot();
        let pulled = match &self.ctx.proxy {
            Some(proxy) => Some(proxy.before_patch().await),
            None => None,
        };
        match pulled {
            Some(Ok(batch)) => {
                let authoritative = self.ctx.config.authoritative_position;
                for (session_id, raw) in &batch.players {
                    self.ctx.state.apply_player_update(session_id, raw, authoritative);
                }
                self.ctx.state.apply_entities(&batch);
            }
            Some(Err(e)) => {
                tracing::warn!(room_id = %self.ctx.room_id, error = %e, "state pull failed");
            }
            None => {}
        }

        if let Some(patch) = self.ctx.state.take_patch() {
            tracing::trace!(room_id = %self.ctx.room_id, snapshot_id = self.ctx.state.snapshot_id(), "patch");
            self.ctx.broadcast(patch);
        }
    }

    /// Tears the room down: probe loops, executor, then the dispose hook.
    ///
    /// Idempotent.
    pub fn shutdown(&mut self) {
        if self.ctx.disposed {
            return;
        }
        self.ctx.disposed = true;
        self.ctx.ping_tasks.clear();
        self.ctx.pings.clear();
        self.ctx.countdown = None;
        self.ctx.reconnects.clear();
        if let Some(proxy) = &mut self.ctx.proxy {
            proxy.dispose();
        }
        self.hooks.on_dispose(&mut self.ctx);

        for sender in self.ctx.clients.values() {
            let _ = sender.send(RoomOutbound::Close);
        }
        self.ctx.clients.clear();
        self.ctx.publish_connected();
        let _ = self.ctx.events.send(RoomEvent::Disposed);
        tracing::info!(room_id = %self.ctx.room_id, "room disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DefaultHooks;

    struct Fixture {
        session: RoomSession,
        events: broadcast::Receiver<RoomEvent>,
        _wakeups: mpsc::UnboundedReceiver<Wakeup>,
    }

    async fn fixture(multiplayer: Value) -> Fixture {
        fixture_with(multiplayer, None).await
    }

    async fn fixture_with(multiplayer: Value, worker: Option<SpawnWorker>) -> Fixture {
        let (events, events_rx) = broadcast::channel(16);
        let (connected, _) = watch::channel(0);
        let (wakeups, wakeups_rx) = mpsc::unbounded_channel();
        let (session, worker_events) = RoomSession::create(RoomSetup {
            room_id: "unit".into(),
            game_data: json!({ "components": { "multiplayer": multiplayer } }),
            hooks: Box::new(DefaultHooks),
            declared: IndexMap::new(),
            worker,
            events,
            connected,
            wakeups,
        })
        .await
        .unwrap();
        drop(worker_events);
        Fixture {
            session,
            events: events_rx,
            _wakeups: wakeups_rx,
        }
    }

    fn client() -> (PlayerSender, mpsc::UnboundedReceiver<RoomOutbound>) {
        mpsc::unbounded_channel()
    }

    // =========================================================================
    // Wakeups
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_handle_wakeup_stale_reconnect_ignored() {
        let mut f = fixture(json!({ "reconnectTimeout": 5 })).await;
        let a = SessionId::from("a");
        let (tx, _rx) = client();
        f.session.join(a.clone(), &Value::Null, tx).unwrap();
        f.session.disconnect(&a, false).unwrap();
        let epoch = f.session.ctx.reconnects[&a].0;

        f.session.handle_wakeup(Wakeup::ReconnectExpired {
            session_id: a.clone(),
            epoch: epoch + 1,
        });
        assert!(f.session.context().player(&a).is_some());

        f.session.handle_wakeup(Wakeup::ReconnectExpired { session_id: a.clone(), epoch });
        assert!(f.session.context().player(&a).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_wakeup_reconnect_after_resume_ignored() {
        let mut f = fixture(json!({ "reconnectTimeout": 5 })).await;
        let a = SessionId::from("a");
        let (tx, _rx) = client();
        f.session.join(a.clone(), &Value::Null, tx).unwrap();
        f.session.disconnect(&a, false).unwrap();
        let epoch = f.session.ctx.reconnects[&a].0;

        let (tx, _rx) = client();
        f.session.reconnect(&a, tx).unwrap();
        f.session.handle_wakeup(Wakeup::ReconnectExpired { session_id: a.clone(), epoch });
        assert!(f.session.context().player(&a).is_some_and(|p| p.connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_wakeup_countdown_from_previous_start_ignored() {
        let mut f = fixture(json!({})).await;
        let (tx, _rx) = client();
        f.session.join(SessionId::from("a"), &Value::Null, tx).unwrap();

        f.session.start_game(Duration::from_secs(5)).unwrap();
        let first = f.session.ctx.countdown_epoch;
        f.session.stop_game().unwrap();
        f.session.start_game(Duration::from_secs(5)).unwrap();

        f.session.handle_wakeup(Wakeup::CountdownElapsed { epoch: first });
        assert_eq!(f.session.phase(), RoomPhase::Countdown);

        let current = f.session.ctx.countdown_epoch;
        f.session.handle_wakeup(Wakeup::CountdownElapsed { epoch: current });
        assert_eq!(f.session.phase(), RoomPhase::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_twice_is_invalid() {
        let mut f = fixture(json!({ "reconnectTimeout": 5 })).await;
        let a = SessionId::from("a");
        let (tx, _rx) = client();
        f.session.join(a.clone(), &Value::Null, tx).unwrap();

        assert_eq!(f.session.disconnect(&a, false).unwrap(), Duration::from_secs(5));
        let err = f.session.disconnect(&a, false).unwrap_err();
        assert!(matches!(err, RoomError::InvalidState(_)));
    }

    // =========================================================================
    // Executor events
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_handle_worker_event_broadcast_honours_exclude() {
        let mut f = fixture(json!({})).await;
        let (tx_a, mut rx_a) = client();
        let (tx_b, mut rx_b) = client();
        f.session.join(SessionId::from("a"), &Value::Null, tx_a).unwrap();
        f.session.join(SessionId::from("b"), &Value::Null, tx_b).unwrap();
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        f.session.handle_worker_event(ExecutorEvent::Send {
            message_type: "boom".into(),
            data: json!(1),
            target: Target::Broadcast {
                exclude: vec![SessionId::from("b")],
            },
        });
        f.session.handle_worker_event(ExecutorEvent::Send {
            message_type: "boom".into(),
            data: json!(2),
            target: Target::Session(SessionId::from("ghost")),
        });

        assert_eq!(
            rx_a.try_recv().unwrap(),
            RoomOutbound::Message(ServerMessage::GameEvent {
                name: "boom".into(),
                data: json!(1),
            })
        );
        assert!(rx_b.try_recv().is_err());
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent() {
        let mut f = fixture(json!({})).await;
        let (tx, mut rx) = client();
        f.session.join(SessionId::from("a"), &Value::Null, tx).unwrap();

        f.session.shutdown();
        f.session.shutdown();

        let disposed = std::iter::from_fn(|| f.events.try_recv().ok())
            .filter(|e| *e == RoomEvent::Disposed)
            .count();
        assert_eq!(disposed, 1);
        assert!(std::iter::from_fn(|| rx.try_recv().ok()).any(|o| o == RoomOutbound::Close));
        assert!(f.session.context().is_disposed());
        assert_eq!(f.session.context().connected_count(), 0);
    }

    // =========================================================================
    // Patches
    // =========================================================================

    /// Takes a while to report its state.
    struct SlowPull;

    impl roomcast_worker::Simulation for SlowPull {
        fn load(
            &mut self,
            _game_data: &Value,
            _ctx: &mut roomcast_worker::SimContext,
        ) -> Result<IndexMap<String, EntityDeclaration>, String> {
            Ok(IndexMap::new())
        }

        fn net_state(&mut self, _ctx: &mut roomcast_worker::SimContext) -> roomcast_worker::NetState {
            std::thread::sleep(Duration::from_millis(200));
            roomcast_worker::NetState::new()
        }
    }

    #[tokio::test]
    async fn test_before_patch_stamps_snapshot_before_pulling() {
        let worker: SpawnWorker = Box::new(|| WorkerProxy::spawn(SlowPull, roomcast_worker::ExecutorKind::Thread));
        let mut f = fixture_with(json!({ "serverEngine": true }), Some(worker)).await;
        let (tx, mut rx) = client();
        f.session.join(SessionId::from("a"), &Value::Null, tx).unwrap();

        let before = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        f.session.before_patch().await;

        let mut stamped = None;
        while let Ok(msg) = rx.try_recv() {
            if let RoomOutbound::Message(ServerMessage::Patch { timestamp, .. }) = msg {
                stamped = Some(timestamp);
            }
        }
        let stamped = stamped.expect("a patch for the new player");
        assert!(stamped < before + 150, "stamped {stamped}ms, pull started at {before}ms");
    }
}
