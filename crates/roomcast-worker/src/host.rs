//! The executor host: runs a [`Simulation`] behind the isolation boundary.
//!
//! The host owns the simulation and everything it touches. It reads
//! [`BoundaryEnvelope`]s one at a time, dispatches each to the
//! simulation inside `catch_unwind`, and answers correlated commands with
//! exactly one [`ExecutorEvent::Reply`].
//!
//! While the game runs, the simulation advances in fixed steps of
//! `1 / tickRate`. Elapsed time is accumulated and paid out as whole
//! steps, so the step count depends only on the clock, not on how often
//! the room pulls state.

use std::any::Any;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use roomcast_protocol::{
    BoundaryEnvelope, BoundaryReply, EntityDeltaBatch, ExecutorCommand, ExecutorEvent, SessionId,
    SpaceLoaded,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{NetStateCache, ServerApi, SimContext, Simulation};

type Reply = Result<Value, String>;

/// Step length before the room has sent its tick rate.
const DEFAULT_TICK_RATE: u32 = 20;

/// Upper bound on steps paid out in one advance. A stalled executor
/// drops the rest instead of spiralling.
const MAX_CATCH_UP_STEPS: u32 = 300;

pub(crate) struct ExecutorHost<S> {
    sim: S,
    ctx: SimContext,
    cache: NetStateCache,
    declared: Vec<String>,
    running: bool,
    tick: Duration,
    accumulated: Duration,
    last_advance: Option<Instant>,
}

impl<S: Simulation> ExecutorHost<S> {
    pub(crate) fn new(sim: S, events: mpsc::UnboundedSender<ExecutorEvent>) -> Self {
        Self {
            sim,
            ctx: SimContext::new(ServerApi::new(events)),
            cache: NetStateCache::new(),
            declared: Vec::new(),
            running: false,
            tick: tick_length(DEFAULT_TICK_RATE),
            accumulated: Duration::ZERO,
            last_advance: None,
        }
    }

    /// Blocking loop for a dedicated thread. Pending steps are paid out
    /// on every state pull.
    pub(crate) fn run_blocking(mut self, mut commands: mpsc::UnboundedReceiver<BoundaryEnvelope>) {
        while let Some(envelope) = commands.blocking_recv() {
            if self.step(envelope).is_break() {
                break;
            }
        }
        tracing::debug!("executor thread finished");
    }

    /// Async loop for a task on the current runtime.
    ///
    /// Besides commands, a ticker at the current step length advances the
    /// simulation between state pulls.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<BoundaryEnvelope>) {
        let mut ticker = step_interval(self.tick);
        loop {
            tokio::select! {
                envelope = commands.recv() => {
                    let Some(envelope) = envelope else { break };
                    if self.step(envelope).is_break() {
                        break;
                    }
                    if ticker.period() != self.tick {
                        ticker = step_interval(self.tick);
                    }
                }
                _ = ticker.tick(), if self.running => {
                    // Panics are reported as ERROR events; the loop keeps going.
                    let _ = self.guarded("UPDATE", |host| host.advance());
                }
            }
            // Keep a busy simulation from starving the rest of the runtime.
            tokio::task::yield_now().await;
        }
        tracing::debug!("executor task finished");
    }

    /// Handles one envelope. Breaks after `DISPOSE`.
    fn step(&mut self, envelope: BoundaryEnvelope) -> ControlFlow<()> {
        let BoundaryEnvelope {
            command,
            correlation_id,
        } = envelope;
        let kind = command.kind();
        let dispose = matches!(command, ExecutorCommand::Dispose);
        tracing::trace!(kind, ?correlation_id, "executor command");

        let reply = self
            .guarded(kind, |host| host.handle(command))
            .unwrap_or_else(|message| Some(Err(message)));

        match (correlation_id, reply) {
            (Some(id), Some(Ok(value))) => self.ctx.api.emit(ExecutorEvent::Reply(BoundaryReply::ok(id, value))),
            (Some(id), Some(Err(error))) => self.ctx.api.emit(ExecutorEvent::Reply(BoundaryReply::err(id, error))),
            (Some(id), None) => self.ctx.api.emit(ExecutorEvent::Reply(BoundaryReply::ok(id, Value::Null))),
            (None, Some(Err(error))) => tracing::warn!(kind, %error, "notification failed"),
            (None, _) => {}
        }

        if dispose {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    /// Runs `f` inside `catch_unwind`. A panic is logged, reported as an
    /// `ERROR` event and returned as its message.
    fn guarded<T>(&mut self, kind: &str, f: impl FnOnce(&mut Self) -> T) -> Result<T, String> {
        panic::catch_unwind(AssertUnwindSafe(|| f(self))).map_err(|payload| {
            let message = format!("simulation panicked in {kind}: {}", panic_message(&*payload));
            tracing::error!(kind, %message, "executor caught panic");
            self.ctx.api.emit(ExecutorEvent::Error {
                message: message.clone(),
            });
            message
        })
    }

    /// Runs one command. `None` means "nothing to answer".
    fn handle(&mut self, command: ExecutorCommand) -> Option<Reply> {
        match command {
            ExecutorCommand::LoadSpace { game_data } => Some(self.load(&game_data)),
            ExecutorCommand::Sync { state, params } => {
                self.ctx.state = state;
                self.tick = tick_length(params.tick_rate);
                self.ctx.params = Some(params);
                self.ctx.players.clear();
                self.sim.on_sync(&mut self.ctx);
                Some(Ok(Value::Null))
            }
            ExecutorCommand::Join(player) => {
                let session_id = session_of(&player)?;
                self.ctx.players.insert(session_id.clone(), player);
                self.sim.on_join(&session_id, &mut self.ctx);
                None
            }
            ExecutorCommand::Leave(player) => {
                let session_id = session_of(&player)?;
                let removed = self.ctx.players.shift_remove(&session_id);
                self.cache.forget_player(&session_id);
                self.sim.on_leave(&removed.unwrap_or(player), &mut self.ctx);
                None
            }
            ExecutorCommand::PlayerState(update) => {
                let session_id = session_of(&update)?;
                self.merge_player_state(&session_id, update);
                self.sim.on_player_state(&session_id, &mut self.ctx);
                None
            }
            ExecutorCommand::Message {
                message_type,
                payload,
                session_id,
            } => {
                self.sim.on_message(&message_type, &payload, &session_id, &mut self.ctx);
                None
            }
            ExecutorCommand::StartGame => {
                self.running = true;
                self.accumulated = Duration::ZERO;
                self.last_advance = Some(Instant::now());
                self.sim.start(&mut self.ctx);
                None
            }
            ExecutorCommand::StopGame => {
                self.advance();
                self.running = false;
                self.sim.stop(&mut self.ctx);
                None
            }
            ExecutorCommand::BeforePatch => Some(self.before_patch()),
            ExecutorCommand::RpcRequest {
                request,
                session_id,
            } => Some(self.sim.rpc(&request, &session_id, &mut self.ctx)),
            ExecutorCommand::Dispose => {
                if self.running {
                    self.running = false;
                    self.sim.stop(&mut self.ctx);
                }
                self.sim.dispose(&mut self.ctx);
                None
            }
        }
    }

    fn load(&mut self, game_data: &Value) -> Reply {
        let entities = self.sim.load(game_data, &mut self.ctx)?;
        self.declared = entities.keys().cloned().collect();
        tracing::info!(kinds = self.declared.len(), "simulation loaded");
        serde_json::to_value(SpaceLoaded { entities }).map_err(|e| e.to_string())
    }

    /// Merges a client update into the executor's player copy.
    ///
    /// With authoritative position the room owns transforms, so
    /// `position` and `rotation` from the client are dropped.
    fn merge_player_state(&mut self, session_id: &SessionId, mut update: Value) {
        if self.ctx.authoritative_position() {
            if let Some(fields) = update.as_object_mut() {
                fields.remove("position");
                fields.remove("rotation");
            }
        }
        match (self.ctx.players.get_mut(session_id), update) {
            (Some(Value::Object(current)), Value::Object(fields)) => current.extend(fields),
            (Some(_), _) => {}
            (None, _) => tracing::warn!(%session_id, "state for unknown player, ignoring"),
        }
    }

    /// Pays out the time elapsed since the last advance as fixed steps.
    fn advance(&mut self) {
        if !self.running {
            return;
        }
        let now = Instant::now();
        let elapsed = self.last_advance.map(|t| now - t).unwrap_or_default();
        self.last_advance = Some(now);
        self.accumulated += elapsed;

        let mut steps = 0;
        while self.accumulated >= self.tick {
            if steps == MAX_CATCH_UP_STEPS {
                tracing::warn!(dropped = ?self.accumulated, "simulation fell behind, skipping steps");
                self.accumulated = Duration::ZERO;
                break;
            }
            self.accumulated -= self.tick;
            self.sim.update(self.tick, &mut self.ctx);
            steps += 1;
        }
    }

    fn before_patch(&mut self) -> Reply {
        self.advance();

        let mut state = self.sim.net_state(&mut self.ctx);
        let declared: HashSet<&str> = self.declared.iter().map(String::as_str).collect();
        state.retain(|kind, _| {
            let known = declared.contains(kind.as_str());
            if !known {
                tracing::warn!(%kind, "net state for undeclared kind, dropping");
            }
            known
        });
        // A kind with no records this pull still has to report removals.
        for kind in &self.declared {
            state.entry(kind.clone()).or_default();
        }

        let batch: EntityDeltaBatch = self.cache.diff(state, &self.ctx.players);
        serde_json::to_value(batch).map_err(|e| e.to_string())
    }
}

fn tick_length(tick_rate: u32) -> Duration {
    Duration::from_secs(1) / tick_rate.max(1)
}

fn step_interval(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn session_of(player: &Value) -> Option<SessionId> {
    match player.get("sessionId").and_then(Value::as_str) {
        Some(id) => Some(SessionId::from(id)),
        None => {
            tracing::warn!("player payload without sessionId, ignoring");
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
