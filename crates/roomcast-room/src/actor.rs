//! Room actor: an isolated Tokio task that owns one [`RoomSession`].
//!
//! The outside world talks to the room through a [`RoomHandle`], which
//! wraps an mpsc channel. Requests that need an answer carry a oneshot
//! reply channel. Inside the task a single loop multiplexes client
//! commands, the room's own timer wakeups, executor events, the patch
//! cadence, and the simulation tick, so the session is only ever touched
//! by one event at a time.

use std::ops::ControlFlow;
use std::time::Duration;

use indexmap::IndexMap;
use roomcast_protocol::{ClientMessage, ExecutorEvent, SessionId};
use roomcast_schema::EntityDeclaration;
use roomcast_tick::{TickConfig, TickScheduler};
use roomcast_worker::{ExecutorKind, Simulation, WorkerError, WorkerEvents, WorkerProxy};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::session::{RoomSetup, SpawnWorker, Wakeup};
use crate::{DefaultHooks, PlayerSender, RoomError, RoomEvent, RoomHooks, RoomPhase, RoomSession};

/// Commands sent to a room actor through its channel.
pub(crate) enum RoomCommand {
    Join {
        session_id: SessionId,
        options: Value,
        sender: PlayerSender,
        reply: oneshot::Sender<Result<Value, RoomError>>,
    },
    Leave {
        session_id: SessionId,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Disconnect {
        session_id: SessionId,
        consented: bool,
        reply: oneshot::Sender<Result<Duration, RoomError>>,
    },
    Reconnect {
        session_id: SessionId,
        sender: PlayerSender,
        reply: oneshot::Sender<Result<Value, RoomError>>,
    },
    /// A client frame (fire-and-forget).
    Message {
        session_id: SessionId,
        msg: ClientMessage,
    },
    StartGame {
        countdown: Duration,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    StopGame {
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    GetInfo {
        reply: oneshot::Sender<RoomInfo>,
    },
    Snapshot {
        reply: oneshot::Sender<Value>,
    },
    Shutdown,
}

/// A snapshot of room metadata (not the game state itself).
#[derive(Debug, Clone, PartialEq)]
pub struct RoomInfo {
    pub room_id: String,
    pub phase: RoomPhase,
    pub player_count: usize,
    /// Players with a live connection.
    pub connected: usize,
    pub max_players: usize,
    pub host: Option<SessionId>,
}

// ---------------------------------------------------------------------------
// RoomHandle
// ---------------------------------------------------------------------------

/// Handle to a running room actor.
///
/// Cheap to clone. When the last handle is dropped the room shuts down.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: String,
    sender: mpsc::Sender<RoomCommand>,
    events: broadcast::Sender<RoomEvent>,
    connected: watch::Receiver<usize>,
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle").field("room_id", &self.room_id).finish()
    }
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Adds a player. Returns the full room snapshot for their client.
    pub async fn join(&self, session_id: SessionId, options: Value, sender: PlayerSender) -> Result<Value, RoomError> {
        self.request(|reply| RoomCommand::Join {
            session_id,
            options,
            sender,
            reply,
        })
        .await?
    }

    pub async fn leave(&self, session_id: SessionId) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::Leave { session_id, reply }).await?
    }

    /// Reports a dropped connection. Returns how long the player may take
    /// to reconnect; zero means they already left.
    pub async fn disconnect(&self, session_id: SessionId, consented: bool) -> Result<Duration, RoomError> {
        self.request(|reply| RoomCommand::Disconnect {
            session_id,
            consented,
            reply,
        })
        .await?
    }

    /// Re-attaches a disconnected player. Returns the full room snapshot.
    pub async fn reconnect(&self, session_id: SessionId, sender: PlayerSender) -> Result<Value, RoomError> {
        self.request(|reply| RoomCommand::Reconnect {
            session_id,
            sender,
            reply,
        })
        .await?
    }

    /// Delivers a client frame (fire-and-forget).
    pub async fn send(&self, session_id: SessionId, msg: ClientMessage) -> Result<(), RoomError> {
        self.sender
            .send(RoomCommand::Message { session_id, msg })
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))
    }

    pub async fn start_game(&self, countdown: Duration) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::StartGame { countdown, reply }).await?
    }

    pub async fn stop_game(&self) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::StopGame { reply }).await?
    }

    pub async fn info(&self) -> Result<RoomInfo, RoomError> {
        self.request(|reply| RoomCommand::GetInfo { reply }).await
    }

    /// The full room state as a new client would receive it.
    pub async fn snapshot(&self) -> Result<Value, RoomError> {
        self.request(|reply| RoomCommand::Snapshot { reply }).await
    }

    /// Lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    /// Number of players with a live connection, updated on every change.
    pub fn connected(&self) -> watch::Receiver<usize> {
        self.connected.clone()
    }

    /// Tells the room to shut down.
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        self.sender
            .send(RoomCommand::Shutdown)
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> RoomCommand) -> Result<T, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(command(reply_tx))
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))
    }
}

// ---------------------------------------------------------------------------
// RoomBuilder
// ---------------------------------------------------------------------------

type SimulationFactory = Box<dyn FnOnce(ExecutorKind) -> Result<(WorkerProxy, WorkerEvents), WorkerError> + Send>;

/// Configures and starts a room.
///
/// ```no_run
/// # async fn demo() -> Result<(), roomcast_room::RoomError> {
/// use roomcast_room::RoomBuilder;
/// use serde_json::json;
///
/// let room = RoomBuilder::new("lobby", json!({
///     "components": { "multiplayer": { "maxPlayers": 8 } }
/// }))
/// .spawn()
/// .await?;
/// # Ok(()) }
/// ```
pub struct RoomBuilder {
    room_id: String,
    game_data: Value,
    hooks: Box<dyn RoomHooks>,
    declared: IndexMap<String, EntityDeclaration>,
    simulation: Option<SimulationFactory>,
    executor_kind: ExecutorKind,
    channel_size: usize,
}

impl RoomBuilder {
    pub fn new(room_id: impl Into<String>, game_data: Value) -> Self {
        Self {
            room_id: room_id.into(),
            game_data,
            hooks: Box::new(DefaultHooks),
            declared: IndexMap::new(),
            simulation: None,
            executor_kind: ExecutorKind::default(),
            channel_size: 256,
        }
    }

    pub fn hooks(mut self, hooks: impl RoomHooks) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// Declares an entity kind owned by room-level code.
    pub fn entity(mut self, kind: impl Into<String>, decl: EntityDeclaration) -> Self {
        self.declared.insert(kind.into(), decl);
        self
    }

    /// Runs `sim` behind the worker proxy when the game enables
    /// `serverEngine`.
    pub fn simulation<S: Simulation>(mut self, sim: S) -> Self {
        self.simulation = Some(Box::new(move |kind| WorkerProxy::spawn(sim, kind)));
        self
    }

    pub fn executor_kind(mut self, kind: ExecutorKind) -> Self {
        self.executor_kind = kind;
        self
    }

    /// Bound of the command channel. Senders wait when it is full.
    pub fn channel_size(mut self, size: usize) -> Self {
        self.channel_size = size.max(1);
        self
    }

    /// Creates the room and starts its actor.
    ///
    /// Waits for the executor handshake, so a game that fails to load or
    /// sync is reported here and no actor is started.
    pub async fn spawn(self) -> Result<RoomHandle, RoomError> {
        let (tx, rx) = mpsc::channel(self.channel_size);
        let (events, _) = broadcast::channel(64);
        let (connected_tx, connected_rx) = watch::channel(0);
        let (wakeup_tx, wakeup_rx) = mpsc::unbounded_channel();

        let kind = self.executor_kind;
        let worker = self
            .simulation
            .map(|factory| -> SpawnWorker { Box::new(move || factory(kind)) });
        let (session, worker_events) = RoomSession::create(RoomSetup {
            room_id: self.room_id.clone(),
            game_data: self.game_data,
            hooks: self.hooks,
            declared: self.declared,
            worker,
            events: events.clone(),
            connected: connected_tx,
            wakeups: wakeup_tx,
        })
        .await?;

        let config = session.context().config();
        let patch_clock = TickScheduler::new(TickConfig::with_rate(config.patch_rate));
        let sim_clock = TickScheduler::paused(TickConfig::with_rate(config.tick_rate));
        let actor = RoomActor {
            session,
            receiver: rx,
            wakeups: wakeup_rx,
            worker_events,
            patch_clock,
            sim_clock,
        };
        tokio::spawn(actor.run());

        Ok(RoomHandle {
            room_id: self.room_id,
            sender: tx,
            events,
            connected: connected_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// RoomActor
// ---------------------------------------------------------------------------

struct RoomActor {
    session: RoomSession,
    receiver: mpsc::Receiver<RoomCommand>,
    wakeups: mpsc::UnboundedReceiver<Wakeup>,
    worker_events: Option<WorkerEvents>,
    patch_clock: TickScheduler,
    /// Drives `on_update`; paused unless the game is running.
    sim_clock: TickScheduler,
}

impl RoomActor {
    async fn run(mut self) {
        let room_id = self.session.context().room_id().to_string();
        tracing::info!(%room_id, "room actor started");

        loop {
            self.sync_sim_clock();
            tokio::select! {
                cmd = self.receiver.recv() => {
                    let Some(cmd) = cmd else { break };
                    if self.handle_command(cmd).is_break() {
                        break;
                    }
                }
                Some(wakeup) = self.wakeups.recv() => self.session.handle_wakeup(wakeup),
                event = next_event(&mut self.worker_events) => match event {
                    Some(event) => self.session.handle_worker_event(event),
                    None => {
                        tracing::warn!(%room_id, "executor channel closed");
                        self.worker_events = None;
                    }
                },
                _ = self.patch_clock.wait_for_tick() => {
                    self.session.before_patch().await;
                    self.patch_clock.record_tick_end();
                }
                tick = self.sim_clock.wait_for_tick() => {
                    self.session.update(tick.dt);
                    self.sim_clock.record_tick_end();
                }
            }
        }

        self.session.shutdown();
        tracing::info!(%room_id, "room actor stopped");
    }

    fn handle_command(&mut self, cmd: RoomCommand) -> ControlFlow<()> {
        match cmd {
            RoomCommand::Join {
                session_id,
                options,
                sender,
                reply,
            } => {
                let _ = reply.send(self.session.join(session_id, &options, sender));
            }
            RoomCommand::Leave { session_id, reply } => {
                let _ = reply.send(self.session.leave(&session_id).map(|_| ()));
            }
            RoomCommand::Disconnect {
                session_id,
                consented,
                reply,
            } => {
                let _ = reply.send(self.session.disconnect(&session_id, consented));
            }
            RoomCommand::Reconnect {
                session_id,
                sender,
                reply,
            } => {
                let _ = reply.send(self.session.reconnect(&session_id, sender));
            }
            RoomCommand::Message { session_id, msg } => self.session.dispatch(&session_id, msg),
            RoomCommand::StartGame { countdown, reply } => {
                let _ = reply.send(self.session.start_game(countdown));
            }
            RoomCommand::StopGame { reply } => {
                let _ = reply.send(self.session.stop_game());
            }
            RoomCommand::GetInfo { reply } => {
                let _ = reply.send(self.info());
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.session.context().state().to_json());
            }
            RoomCommand::Shutdown => {
                tracing::info!(room_id = self.session.context().room_id(), "room shutting down");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Runs the simulation clock only while the game is running.
    fn sync_sim_clock(&mut self) {
        let running = self.session.phase() == RoomPhase::Running;
        if running && self.sim_clock.is_paused() {
            self.sim_clock.resume();
        } else if !running && !self.sim_clock.is_paused() {
            self.sim_clock.pause();
        }
    }

    fn info(&self) -> RoomInfo {
        let ctx = self.session.context();
        RoomInfo {
            room_id: ctx.room_id().to_string(),
            phase: ctx.phase(),
            player_count: ctx.state().player_count(),
            connected: ctx.connected_count(),
            max_players: ctx.config().max_players,
            host: ctx.host().cloned(),
        }
    }
}

/// Next executor event, or pending forever without an executor.
async fn next_event(events: &mut Option<WorkerEvents>) -> Option<ExecutorEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
