//! The room's side of the isolation boundary.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use roomcast_protocol::{
    BoundaryEnvelope, EntityDeltaBatch, ExecutorCommand, ExecutorEvent, SessionId, SpaceLoaded,
    SyncParams,
};
use roomcast_rpc::{PendingCalls, PendingReply, RpcError};
use roomcast_schema::EntityRegistry;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::host::ExecutorHost;
use crate::{Simulation, WorkerError};

/// Where the executor runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutorKind {
    /// A dedicated OS thread. Simulation code can block without stalling
    /// the room.
    #[default]
    Thread,
    /// A task on the current Tokio runtime.
    Task,
}

/// Events the executor sends that the room has to act on.
///
/// Replies never show up here; the proxy settles them itself.
pub type WorkerEvents = mpsc::UnboundedReceiver<ExecutorEvent>;

/// One logical channel to one executor.
///
/// ```text
///  WorkerProxy ──BoundaryEnvelope──▶ ExecutorHost<S>
///      ▲                                  │
///      │ settle(reply)                    │ ExecutorEvent
///  reply pump ◀───────────────────────────┘
///      │ Send / Disconnect / Error
///      ▼
///  WorkerEvents (room)
/// ```
///
/// Lifecycle notifications are fire-and-forget. Calls register a pending
/// entry and resolve when the reply pump sees the matching reply, or
/// with [`RpcError::Cancelled`] when the executor goes away first.
pub struct WorkerProxy {
    commands: mpsc::UnboundedSender<BoundaryEnvelope>,
    pending: Arc<Mutex<PendingCalls>>,
    disposed: bool,
}

impl std::fmt::Debug for WorkerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProxy")
            .field("pending", &lock(&self.pending).len())
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl WorkerProxy {
    /// Starts an executor running `sim` and the reply pump.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// [`WorkerError::Spawn`] if the executor thread can't be created.
    pub fn spawn<S: Simulation>(sim: S, kind: ExecutorKind) -> Result<(Self, WorkerEvents), WorkerError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();

        let host = ExecutorHost::new(sim, event_tx);
        match kind {
            ExecutorKind::Thread => {
                std::thread::Builder::new()
                    .name("roomcast-executor".into())
                    .spawn(move || host.run_blocking(command_rx))?;
            }
            ExecutorKind::Task => {
                tokio::spawn(host.run(command_rx));
            }
        }

        let pending = Arc::new(Mutex::new(PendingCalls::new()));
        tokio::spawn(pump(event_rx, Arc::clone(&pending), relay_tx));
        tracing::debug!(?kind, "executor started");

        Ok((
            Self {
                commands: command_tx,
                pending,
                disposed: false,
            },
            relay_rx,
        ))
    }

    /// Loads the game and builds the registry from the kinds the
    /// simulation declared.
    ///
    /// # Errors
    /// [`WorkerError::Load`] if the simulation rejected the game, or a
    /// schema error if a declaration doesn't compile.
    pub async fn init(&self, game_data: Value) -> Result<EntityRegistry, WorkerError> {
        let value = roomcast_rpc::wait(self.call(ExecutorCommand::LoadSpace { game_data }))
            .await
            .map_err(WorkerError::Load)?;
        let loaded: SpaceLoaded = serde_json::from_value(value)?;

        let mut registry = EntityRegistry::new();
        registry.register_all(loaded.entities.iter().map(|(kind, decl)| (kind.as_str(), decl)))?;
        tracing::info!(kinds = registry.len(), "executor loaded");
        Ok(registry)
    }

    /// Hands the room state to the executor and waits until it's ready.
    pub async fn sync(&self, state: Value, params: SyncParams) -> Result<(), WorkerError> {
        roomcast_rpc::wait(self.call(ExecutorCommand::Sync { state, params }))
            .await
            .map_err(WorkerError::Sync)?;
        Ok(())
    }

    pub fn start_game(&self) {
        self.notify(ExecutorCommand::StartGame);
    }

    pub fn stop_game(&self) {
        self.notify(ExecutorCommand::StopGame);
    }

    pub fn on_join(&self, player: Value) {
        self.notify(ExecutorCommand::Join(player));
    }

    pub fn on_leave(&self, player: Value) {
        self.notify(ExecutorCommand::Leave(player));
    }

    pub fn on_player_state(&self, player: Value) {
        self.notify(ExecutorCommand::PlayerState(player));
    }

    pub fn on_message(&self, message_type: impl Into<String>, payload: Value, session_id: SessionId) {
        self.notify(ExecutorCommand::Message {
            message_type: message_type.into(),
            payload,
            session_id,
        });
    }

    /// Pulls what changed inside the executor since the last pull.
    pub async fn before_patch(&self) -> Result<EntityDeltaBatch, WorkerError> {
        let value = roomcast_rpc::wait(self.call(ExecutorCommand::BeforePatch)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Forwards a client RPC to the simulation.
    ///
    /// The returned future doesn't borrow the proxy, so the room can await
    /// it off its event loop.
    pub fn rpc(
        &self,
        request: Value,
        session_id: SessionId,
    ) -> impl Future<Output = Result<Value, WorkerError>> + Send + 'static {
        let reply = self.call(ExecutorCommand::RpcRequest {
            request,
            session_id,
        });
        async move { Ok(roomcast_rpc::wait(reply).await?) }
    }

    /// Number of calls still waiting for a reply.
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Terminates the executor and cancels every pending call.
    ///
    /// Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.notify(ExecutorCommand::Dispose);
        let cancelled = lock(&self.pending).cancel_all();
        tracing::info!(cancelled, "executor disposed");
    }

    fn notify(&self, command: ExecutorCommand) {
        if self.disposed {
            tracing::debug!(kind = command.kind(), "executor disposed, dropping notification");
            return;
        }
        let kind = command.kind();
        if self.commands.send(BoundaryEnvelope::notify(command)).is_err() {
            tracing::warn!(kind, "executor gone, dropping notification");
        }
    }

    /// Sends a correlated command. The reply settles with
    /// [`RpcError::Closed`] if it can't be delivered.
    fn call(&self, command: ExecutorCommand) -> PendingReply {
        let mut pending = lock(&self.pending);
        let (id, reply) = pending.register();
        if self.disposed {
            pending.complete(id, Err(RpcError::Cancelled));
            return reply;
        }
        let kind = command.kind();
        tracing::debug!(kind, correlation_id = %id, "executor call");
        if self.commands.send(BoundaryEnvelope::call(command, id)).is_err() {
            tracing::warn!(kind, correlation_id = %id, "executor gone, call not sent");
            pending.complete(id, Err(RpcError::Closed));
        }
        reply
    }
}

impl Drop for WorkerProxy {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Reads executor events until the executor is gone.
///
/// Replies settle their pending call; everything else goes to the room.
/// When the channel closes every call still pending is cancelled.
async fn pump(
    mut events: mpsc::UnboundedReceiver<ExecutorEvent>,
    pending: Arc<Mutex<PendingCalls>>,
    relay: mpsc::UnboundedSender<ExecutorEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ExecutorEvent::Reply(reply) => {
                lock(&pending).settle(reply);
            }
            ExecutorEvent::Error { ref message } => {
                tracing::error!(%message, "executor error");
                let _ = relay.send(event);
            }
            other => {
                if relay.send(other).is_err() {
                    tracing::trace!("room gone, dropping executor event");
                }
            }
        }
    }
    let cancelled = lock(&pending).cancel_all();
    tracing::debug!(cancelled, "executor channel closed");
}

fn lock(pending: &Mutex<PendingCalls>) -> MutexGuard<'_, PendingCalls> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}
