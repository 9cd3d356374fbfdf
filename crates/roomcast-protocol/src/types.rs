//! Client ↔ session wire types.
//!
//! Every frame a browser client sends or receives is one of the enums in
//! this module, serialized as JSON with a `"type"` tag in
//! SCREAMING_SNAKE_CASE:
//!
//! ```text
//! → {"type":"PLAYER_STATE","data":[0,1,0, 0,0,0, "walk",1,"",  "",null]}
//! → {"type":"RPC","rpcId":"@@engine","data":{...},"msgId":"m1"}
//! ← {"type":"PING","data":12}
//! → {"type":"PONG","data":12}
//! ← {"type":"ROOM_GAME_ACTION","action":"START","data":4.8}
//! ```

use std::borrow::Borrow;
use std::fmt;

use indexmap::IndexMap;
use roomcast_schema::EntityPatch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifies one participant's session inside a room.
///
/// A newtype over `String` so a session id can't be mixed up with a user
/// id or an entity owner id. `#[serde(transparent)]` keeps it a plain
/// string on the wire.
///
/// `Borrow<str>` lets maps keyed by `SessionId` be queried with a `&str`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Matches a cross-boundary reply to the call that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// A 3-component vector used for positions and rotations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

// ---------------------------------------------------------------------------
// PLAYER_STATE frame
// ---------------------------------------------------------------------------

/// The wire tuple, in order: position xyz, rotation xyz, animation,
/// scale, vrmUrl, text, input.
type FrameTuple = (
    f64,
    f64,
    f64,
    f64,
    f64,
    f64,
    String,
    f64,
    String,
    String,
    Value,
);

/// A client's avatar update.
///
/// On the wire this is a positional array (it is sent many times per
/// second, so field names would dominate the frame). `#[serde(from, into)]`
/// converts through [`FrameTuple`] so the rest of the code works with
/// named fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "FrameTuple", into = "FrameTuple")]
pub struct PlayerStateFrame {
    pub position: Vec3,
    pub rotation: Vec3,
    pub animation: String,
    pub scale: f64,
    pub vrm_url: String,
    pub text: String,
    /// Game-defined input payload, passed through untouched.
    pub input: Value,
}

impl From<FrameTuple> for PlayerStateFrame {
    fn from(t: FrameTuple) -> Self {
        Self {
            position: Vec3::new(t.0, t.1, t.2),
            rotation: Vec3::new(t.3, t.4, t.5),
            animation: t.6,
            scale: t.7,
            vrm_url: t.8,
            text: t.9,
            input: t.10,
        }
    }
}

impl From<PlayerStateFrame> for FrameTuple {
    fn from(f: PlayerStateFrame) -> Self {
        (
            f.position.x,
            f.position.y,
            f.position.z,
            f.rotation.x,
            f.rotation.y,
            f.rotation.z,
            f.animation,
            f.scale,
            f.vrm_url,
            f.text,
            f.input,
        )
    }
}

// ---------------------------------------------------------------------------
// Game actions
// ---------------------------------------------------------------------------

/// Lifecycle actions carried by `GAME_REQUEST` and `ROOM_GAME_ACTION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameAction {
    Start,
    Stop,
}

// ---------------------------------------------------------------------------
// ClientMessage
// ---------------------------------------------------------------------------

/// Messages a client sends to the room.
///
/// `rename_all` renames the variants (`PlayerState` → `"PLAYER_STATE"`),
/// `rename_all_fields` renames the fields inside them (`rpc_id` →
/// `"rpcId"`), matching what the browser SDK sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// First frame on a connection: join options, plus a reconnect token
    /// when resuming a dropped session.
    Join {
        #[serde(default)]
        options: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reconnect_token: Option<String>,
    },

    /// Avatar transform and presentation.
    PlayerState { data: PlayerStateFrame },

    /// Free-form game message. `{type:"broadcast"}` and `{type:"send"}`
    /// payloads are relayed to other players.
    GameMessage { data: Value },

    /// Ask the room to change lifecycle, e.g. `START` with a countdown.
    GameRequest {
        action: GameAction,
        #[serde(default)]
        data: Value,
    },

    /// Remote call routed by `rpc_id`. A reply is sent back only when
    /// `msg_id` is present.
    Rpc {
        rpc_id: String,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg_id: Option<String>,
    },

    /// Client-initiated liveness probe; answered with `PONG`.
    Ping {
        #[serde(default)]
        data: Value,
    },

    /// Reply to a server `PING`, echoing its id.
    Pong { data: u64 },
}

impl ClientMessage {
    /// The wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "JOIN",
            Self::PlayerState { .. } => "PLAYER_STATE",
            Self::GameMessage { .. } => "GAME_MESSAGE",
            Self::GameRequest { .. } => "GAME_REQUEST",
            Self::Rpc { .. } => "RPC",
            Self::Ping { .. } => "PING",
            Self::Pong { .. } => "PONG",
        }
    }
}

// ---------------------------------------------------------------------------
// ServerMessage
// ---------------------------------------------------------------------------

/// Messages the room sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Handshake accepted. `state` is a full snapshot of the room; later
    /// changes arrive as `PATCH` frames.
    Joined {
        session_id: SessionId,
        reconnect_token: String,
        state: Value,
    },

    /// Liveness probe. The client must answer `PONG` with the same id.
    Ping { data: u64 },

    /// Answer to a client `PING`.
    Pong { data: Value },

    /// Reply to (or server-initiated) remote call.
    Rpc {
        rpc_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg_id: Option<String>,
        data: Value,
    },

    /// Payload relayed from another player.
    RoomMessage { data: Value },

    /// Lifecycle notification. For `START`, `data` is the delay in seconds
    /// before the client should consider the game running.
    RoomGameAction {
        action: GameAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<f64>,
    },

    /// A message produced by the simulation, with its own `name`.
    GameEvent { name: String, data: Value },

    /// Incremental room state since the previous patch.
    Patch {
        snapshot_id: String,
        timestamp: u64,
        #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
        players: IndexMap<SessionId, Value>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        removed_players: Vec<SessionId>,
        #[serde(default, skip_serializing_if = "EntityPatch::is_empty")]
        entities: EntityPatch,
    },

    /// Something went wrong. `code` follows HTTP conventions:
    /// 400 malformed, 403 not allowed now, 404 unknown target,
    /// 409 room full, 500 simulation failure.
    Error { code: u16, message: String },
}

impl ServerMessage {
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    //! The browser SDK parses these exact shapes, so each test pins the
    //! JSON a variant produces or accepts.

    use serde_json::json;

    use super::*;

    // =====================================================================
    // Identity types
    // =====================================================================

    #[test]
    fn test_session_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&SessionId::new("abc")).unwrap();
        assert_eq!(json, "\"abc\"");
    }

    #[test]
    fn test_session_id_borrows_as_str() {
        let mut map = IndexMap::new();
        map.insert(SessionId::new("abc"), 1);
        assert_eq!(map.get("abc"), Some(&1));
    }

    #[test]
    fn test_correlation_id_display() {
        assert_eq!(CorrelationId(9).to_string(), "C-9");
    }

    // =====================================================================
    // ClientMessage
    // =====================================================================

    #[test]
    fn test_player_state_decodes_from_tuple() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "PLAYER_STATE",
            "data": [1, 2, 3, 0, 1.5, 0, "run", 1, "avatar.vrm", "hi", { "jump": true }]
        }))
        .unwrap();

        let ClientMessage::PlayerState { data } = msg else {
            panic!("expected PLAYER_STATE");
        };
        assert_eq!(data.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(data.rotation.y, 1.5);
        assert_eq!(data.animation, "run");
        assert_eq!(data.vrm_url, "avatar.vrm");
        assert_eq!(data.input, json!({ "jump": true }));
    }

    #[test]
    fn test_player_state_short_tuple_rejected() {
        let result: Result<ClientMessage, _> = serde_json::from_value(json!({
            "type": "PLAYER_STATE",
            "data": [1, 2, 3]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_rpc_uses_camel_case_fields() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "RPC",
            "rpcId": "@@engine",
            "data": { "id": "door" },
            "msgId": "m1"
        }))
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Rpc {
                rpc_id: "@@engine".into(),
                data: json!({ "id": "door" }),
                msg_id: Some("m1".into()),
            }
        );
    }

    #[test]
    fn test_rpc_without_msg_id() {
        let msg: ClientMessage =
            serde_json::from_value(json!({ "type": "RPC", "rpcId": "chat" })).unwrap();
        assert!(matches!(msg, ClientMessage::Rpc { msg_id: None, .. }));
    }

    #[test]
    fn test_game_request_start() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "GAME_REQUEST",
            "action": "START",
            "data": { "countdown": 5 }
        }))
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::GameRequest {
                action: GameAction::Start,
                data: json!({ "countdown": 5 }),
            }
        );
    }

    #[test]
    fn test_join_with_reconnect_token() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "JOIN",
            "options": { "username": "ada" },
            "reconnectToken": "tok"
        }))
        .unwrap();
        assert_eq!(msg.kind(), "JOIN");
        assert!(matches!(
            msg,
            ClientMessage::Join { reconnect_token: Some(ref t), .. } if t == "tok"
        ));
    }

    #[test]
    fn test_unknown_client_type_rejected() {
        let result: Result<ClientMessage, _> =
            serde_json::from_value(json!({ "type": "FLY_TO_MOON" }));
        assert!(result.is_err());
    }

    // =====================================================================
    // ServerMessage
    // =====================================================================

    #[test]
    fn test_room_game_action_start_json_format() {
        let msg = ServerMessage::RoomGameAction {
            action: GameAction::Start,
            data: Some(4.8),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, json!({ "type": "ROOM_GAME_ACTION", "action": "START", "data": 4.8 }));
    }

    #[test]
    fn test_room_game_action_stop_omits_data() {
        let msg = ServerMessage::RoomGameAction {
            action: GameAction::Stop,
            data: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, json!({ "type": "ROOM_GAME_ACTION", "action": "STOP" }));
    }

    #[test]
    fn test_patch_omits_empty_sections() {
        let msg = ServerMessage::Patch {
            snapshot_id: "a1b2c".into(),
            timestamp: 1000,
            players: IndexMap::new(),
            removed_players: Vec::new(),
            entities: EntityPatch::default(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({ "type": "PATCH", "snapshotId": "a1b2c", "timestamp": 1000 })
        );
    }

    #[test]
    fn test_error_json_format() {
        let json = serde_json::to_value(ServerMessage::error(409, "Room is full 2 >= 2")).unwrap();
        assert_eq!(json["type"], "ERROR");
        assert_eq!(json["code"], 409);
        assert_eq!(json["message"], "Room is full 2 >= 2");
    }

    #[test]
    fn test_joined_round_trip() {
        let msg = ServerMessage::Joined {
            session_id: SessionId::new("s1"),
            reconnect_token: "tok".into(),
            state: json!({ "players": {} }),
        };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let decoded: ServerMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }
}
