//! Session ↔ executor boundary protocol.
//!
//! The simulation runs behind an isolation boundary (its own thread or
//! task). Nothing crosses that boundary except the messages in this
//! module:
//!
//! ```text
//! session ──BoundaryEnvelope<ExecutorCommand>──▶ executor
//! session ◀──────────ExecutorEvent──────────── executor
//! ```
//!
//! A command that expects an answer carries a [`CorrelationId`]; the
//! executor answers with exactly one [`ExecutorEvent::Reply`] holding the
//! same id. A command without an id is a one-way notification.

use indexmap::IndexMap;
use roomcast_schema::EntityDeclaration;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CorrelationId, ProtocolError, SessionId};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// `{type, payload, correlationId?}` as it crosses the boundary.
///
/// `#[serde(flatten)]` lifts the command's `type`/`payload` keys to the
/// envelope's top level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryEnvelope {
    #[serde(flatten)]
    pub command: ExecutorCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl BoundaryEnvelope {
    /// A one-way notification.
    pub fn notify(command: ExecutorCommand) -> Self {
        Self {
            command,
            correlation_id: None,
        }
    }

    /// A call whose reply will carry `id`.
    pub fn call(command: ExecutorCommand, id: CorrelationId) -> Self {
        Self {
            command,
            correlation_id: Some(id),
        }
    }
}

// ---------------------------------------------------------------------------
// Session → executor
// ---------------------------------------------------------------------------

/// Room parameters handed to the executor on `SYNC`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncParams {
    pub authoritative_position: bool,
    pub max_players: usize,
    pub tick_rate: u32,
    pub patch_rate: u32,
}

/// Everything the session tells the executor.
///
/// Adjacently tagged: `{"type":"JOIN","payload":{...}}`. Unit variants
/// such as `START_GAME` carry no `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ExecutorCommand {
    /// Load the game. Answered with a [`SpaceLoaded`] value.
    LoadSpace { game_data: Value },
    /// Hand over the initial room state. Answered once the executor is ready.
    Sync { state: Value, params: SyncParams },
    /// A player joined; the payload is the player's JSON.
    Join(Value),
    /// A player left.
    Leave(Value),
    /// A player's state changed.
    PlayerState(Value),
    /// A client game message, forwarded as-is.
    Message {
        message_type: String,
        payload: Value,
        session_id: SessionId,
    },
    StartGame,
    StopGame,
    /// Collect changed state. Answered with an [`EntityDeltaBatch`].
    BeforePatch,
    /// A client RPC for the simulation. Answered with the call's value.
    RpcRequest {
        request: Value,
        session_id: SessionId,
    },
    /// Tear down. No reply.
    Dispose,
}

impl ExecutorCommand {
    /// The wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LoadSpace { .. } => "LOAD_SPACE",
            Self::Sync { .. } => "SYNC",
            Self::Join(_) => "JOIN",
            Self::Leave(_) => "LEAVE",
            Self::PlayerState(_) => "PLAYER_STATE",
            Self::Message { .. } => "MESSAGE",
            Self::StartGame => "START_GAME",
            Self::StopGame => "STOP_GAME",
            Self::BeforePatch => "BEFORE_PATCH",
            Self::RpcRequest { .. } => "RPC_REQUEST",
            Self::Dispose => "DISPOSE",
        }
    }
}

/// The `LOAD_SPACE` answer: every entity kind the simulation declared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceLoaded {
    pub entities: IndexMap<String, EntityDeclaration>,
}

// ---------------------------------------------------------------------------
// Per-tick deltas
// ---------------------------------------------------------------------------

/// One changed entity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDelta {
    pub owner_id: String,
    pub version: u64,
    pub state: Value,
}

/// What changed inside the executor since the previous `BEFORE_PATCH`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDeltaBatch {
    /// `session id → raw player update`.
    #[serde(default)]
    pub players: IndexMap<SessionId, Value>,
    /// `kind → changed records`.
    #[serde(default)]
    pub entities: IndexMap<String, Vec<EntityDelta>>,
    /// `kind → owners` whose records disappeared.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub removed: IndexMap<String, Vec<String>>,
}

impl EntityDeltaBatch {
    pub fn is_empty(&self) -> bool {
        self.players.is_empty() && self.entities.is_empty() && self.removed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Executor → session
// ---------------------------------------------------------------------------

/// Who a relayed message goes to.
///
/// Decided by the shape of the JSON `target` field:
///
/// | JSON                | meaning                         |
/// |---------------------|---------------------------------|
/// | `"*"`               | everyone                        |
/// | `["a", "b"]`        | everyone except `a` and `b`     |
/// | `"a"`               | only session `a`                |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Target {
    Broadcast { exclude: Vec<SessionId> },
    Session(SessionId),
}

impl Target {
    pub fn everyone() -> Self {
        Self::Broadcast {
            exclude: Vec::new(),
        }
    }
}

impl TryFrom<Value> for Target {
    type Error = ProtocolError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(s) if s == "*" => Ok(Self::everyone()),
            Value::String(s) => Ok(Self::Session(SessionId(s))),
            Value::Null => Ok(Self::everyone()),
            Value::Array(items) => {
                let exclude = items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(s) => Ok(SessionId(s)),
                        other => Err(ProtocolError::InvalidMessage(format!(
                            "exclude list entries must be session ids, got {other}"
                        ))),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Broadcast { exclude })
            }
            other => Err(ProtocolError::InvalidMessage(format!(
                "invalid relay target: {other}"
            ))),
        }
    }
}

impl From<Target> for Value {
    fn from(target: Target) -> Self {
        match target {
            Target::Broadcast { exclude } if exclude.is_empty() => Value::from("*"),
            Target::Broadcast { exclude } => {
                Value::Array(exclude.into_iter().map(|s| Value::String(s.0)).collect())
            }
            Target::Session(id) => Value::String(id.0),
        }
    }
}

/// `{correlationId, success, value | error}`: the answer to one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryReply {
    pub correlation_id: CorrelationId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BoundaryReply {
    pub fn ok(correlation_id: CorrelationId, value: Value) -> Self {
        Self {
            correlation_id,
            success: true,
            value,
            error: None,
        }
    }

    pub fn err(correlation_id: CorrelationId, error: impl Into<String>) -> Self {
        Self {
            correlation_id,
            success: false,
            value: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Splits into the call's outcome.
    pub fn into_result(self) -> Result<Value, String> {
        if self.success {
            Ok(self.value)
        } else {
            Err(self.error.unwrap_or_else(|| "unknown executor error".into()))
        }
    }
}

/// Everything the executor tells the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ExecutorEvent {
    /// Settles the pending call with the same correlation id.
    Reply(BoundaryReply),
    /// Relay a simulation message to clients.
    Send {
        message_type: String,
        data: Value,
        target: Target,
    },
    /// Ask the session to drop a player.
    Disconnect { session_id: SessionId },
    /// The simulation failed outside any call.
    Error { message: String },
}
