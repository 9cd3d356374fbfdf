//! Canonical room state: players, settings, and entity collections.
//!
//! Only the room session writes to [`RoomState`]. Every write is tracked
//! so [`RoomState::take_patch`] can ship just what changed since the
//! previous patch; new clients get [`RoomState::to_json`] instead.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use indexmap::{IndexMap, IndexSet};
use rand::Rng;
use rand::distr::Alphanumeric;
use roomcast_protocol::{EntityDeltaBatch, PlayerStateFrame, ServerMessage, SessionId, Vec3};
use roomcast_schema::{EntityRegistry, EntityStore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::RoomConfig;

// ---------------------------------------------------------------------------
// PlayerState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerRole {
    Host,
    #[default]
    Player,
}

/// One participant as every client sees them.
///
/// Game-defined fields written by the simulation live in `extra` and are
/// flattened into the same JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub session_id: SessionId,
    pub user_id: String,
    pub name: String,
    pub avatar_url: String,
    pub vrm_url: String,
    pub is_anonymous: bool,
    pub role: PlayerRole,
    pub position: Vec3,
    pub rotation: Vec3,
    pub scale: f64,
    pub animation: String,
    pub text: String,
    /// Smoothed one-way latency in milliseconds.
    pub latency: f64,
    pub jitter: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// Whether a live connection is attached. Never broadcast.
    #[serde(skip)]
    pub connected: bool,
}

/// Fields the simulation never writes back: room-owned ones, plus the
/// raw client input it was handed.
const ROOM_OWNED: &[&str] = &["sessionId", "role", "latency", "jitter", "connected", "input"];

/// Fields the client owns unless the room is position-authoritative.
const TRANSFORM: &[&str] = &["position", "rotation"];

impl PlayerState {
    /// Builds a player from the client's join options.
    ///
    /// Missing options fall back to an anonymous player:
    /// `userId` "anon", `username` "Anonymous", animation "idle".
    pub fn from_options(session_id: SessionId, options: &Value) -> Self {
        let text = |key: &str| options.get(key).and_then(Value::as_str).map(str::to_string);
        let user_id = text("userId").or_else(|| text("id"));
        Self {
            session_id,
            is_anonymous: options
                .get("isAnonymous")
                .and_then(Value::as_bool)
                .unwrap_or(user_id.is_none()),
            user_id: user_id.unwrap_or_else(|| "anon".into()),
            name: text("username").unwrap_or_else(|| "Anonymous".into()),
            avatar_url: text("avatarUrl").unwrap_or_default(),
            vrm_url: text("vrmUrl").unwrap_or_default(),
            role: PlayerRole::Player,
            position: Vec3::default(),
            rotation: Vec3::default(),
            scale: 1.0,
            animation: "idle".into(),
            text: String::new(),
            latency: 0.0,
            jitter: 0.0,
            extra: Map::new(),
            connected: true,
        }
    }

    pub fn is_host(&self) -> bool {
        self.role == PlayerRole::Host
    }

    /// Applies a client `PLAYER_STATE` frame. Returns `true` if anything
    /// changed.
    pub fn apply_frame(&mut self, frame: &PlayerStateFrame, authoritative_position: bool) -> bool {
        let before = self.clone();
        if !authoritative_position {
            self.position = frame.position;
            self.rotation = frame.rotation;
        }
        self.animation.clone_from(&frame.animation);
        self.scale = frame.scale;
        self.vrm_url.clone_from(&frame.vrm_url);
        self.text.clone_from(&frame.text);
        *self != before
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// RoomState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    pub tick_rate: u32,
    pub patch_rate: u32,
    /// Seconds.
    pub reconnect_timeout: f64,
}

impl From<&RoomConfig> for RoomSettings {
    fn from(config: &RoomConfig) -> Self {
        Self {
            tick_rate: config.tick_rate,
            patch_rate: config.patch_rate,
            reconnect_timeout: config.reconnect_timeout.as_secs_f64(),
        }
    }
}

#[derive(Debug)]
pub struct RoomState {
    snapshot_id: String,
    timestamp: u64,
    players: IndexMap<SessionId, PlayerState>,
    settings: RoomSettings,
    entities: EntityStore,
    dirty_players: IndexSet<SessionId>,
    removed_players: IndexSet<SessionId>,
}

impl RoomState {
    pub fn new(settings: RoomSettings, registry: Arc<EntityRegistry>) -> Self {
        Self {
            snapshot_id: snapshot_id(),
            timestamp: now_millis(),
            players: IndexMap::new(),
            settings,
            entities: EntityStore::new(registry),
            dirty_players: IndexSet::new(),
            removed_players: IndexSet::new(),
        }
    }

    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    /// Milliseconds since the Unix epoch at the last snapshot.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn settings(&self) -> &RoomSettings {
        &self.settings
    }

    /// Players in join order.
    pub fn players(&self) -> &IndexMap<SessionId, PlayerState> {
        &self.players
    }

    pub fn player(&self, session_id: &SessionId) -> Option<&PlayerState> {
        self.players.get(session_id)
    }

    /// Mutable access that marks the player for the next patch.
    pub fn player_mut(&mut self, session_id: &SessionId) -> Option<&mut PlayerState> {
        let player = self.players.get_mut(session_id)?;
        self.dirty_players.insert(session_id.clone());
        Some(player)
    }

    /// Runs `update` on a player and marks them for the next patch if it
    /// returns `true`. `None` if the player isn't in the room.
    pub fn update_player<F>(&mut self, session_id: &SessionId, update: F) -> Option<bool>
    where
        F: FnOnce(&mut PlayerState) -> bool,
    {
        let changed = update(self.players.get_mut(session_id)?);
        if changed {
            self.dirty_players.insert(session_id.clone());
        }
        Some(changed)
    }

    /// Flips the transient connection flag. Not part of any patch.
    pub fn set_connected(&mut self, session_id: &SessionId, connected: bool) -> bool {
        match self.players.get_mut(session_id) {
            Some(player) => {
                player.connected = connected;
                true
            }
            None => false,
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn add_player(&mut self, player: PlayerState) {
        let session_id = player.session_id.clone();
        self.removed_players.shift_remove(&session_id);
        self.dirty_players.insert(session_id.clone());
        self.players.insert(session_id, player);
    }

    /// Removes a player, keeping the join order of the rest.
    pub fn remove_player(&mut self, session_id: &SessionId) -> Option<PlayerState> {
        let player = self.players.shift_remove(session_id)?;
        self.dirty_players.shift_remove(session_id);
        self.removed_players.insert(session_id.clone());
        Some(player)
    }

    /// Merges a raw player object from the simulation.
    ///
    /// Room-owned fields are skipped, and so are transforms unless
    /// `authoritative_position` is set. Returns `true` if the player
    /// changed.
    pub fn apply_player_update(&mut self, session_id: &SessionId, raw: &Value, authoritative_position: bool) -> bool {
        let Some(player) = self.players.get(session_id) else {
            tracing::warn!(%session_id, "update for unknown player, ignoring");
            return false;
        };
        let Some(fields) = raw.as_object() else {
            tracing::warn!(%session_id, "player update is not an object, ignoring");
            return false;
        };

        let mut merged = player.to_json();
        let Some(current) = merged.as_object_mut() else {
            return false;
        };
        for (key, value) in fields {
            if ROOM_OWNED.contains(&key.as_str()) || (!authoritative_position && TRANSFORM.contains(&key.as_str())) {
                continue;
            }
            current.insert(key.clone(), value.clone());
        }

        let mut updated: PlayerState = match serde_json::from_value(merged) {
            Ok(updated) => updated,
            Err(error) => {
                tracing::warn!(%session_id, %error, "malformed player update, ignoring");
                return false;
            }
        };
        updated.connected = player.connected;
        if updated == *player {
            return false;
        }
        self.dirty_players.insert(session_id.clone());
        self.players.insert(session_id.clone(), updated);
        true
    }

    /// Applies the entity part of a pulled batch. Returns how many
    /// records changed.
    ///
    /// A record the store rejects, such as one of an unregistered kind,
    /// is logged and skipped. The rest of the batch still applies.
    pub fn apply_entities(&mut self, batch: &EntityDeltaBatch) -> usize {
        let mut changed = 0;
        for (kind, deltas) in &batch.entities {
            for delta in deltas {
                match self.entities.apply(kind, &delta.owner_id, delta.version, &delta.state) {
                    Ok(true) => changed += 1,
                    Ok(false) => {}
                    Err(error) => {
                        tracing::warn!(%kind, owner = %delta.owner_id, %error, "entity update rejected");
                    }
                }
            }
        }
        for (kind, owners) in &batch.removed {
            for owner in owners {
                match self.entities.remove(kind, owner) {
                    Ok(true) => changed += 1,
                    Ok(false) => {}
                    Err(error) => tracing::warn!(%kind, %owner, %error, "entity removal rejected"),
                }
            }
        }
        changed
    }

    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    pub fn entities_mut(&mut self) -> &mut EntityStore {
        &mut self.entities
    }

    /// Current JSON of one entity record.
    pub fn entity(&self, kind: &str, owner: &str) -> Option<Value> {
        self.entities.entity(kind, owner)
    }

    pub fn registered_kinds(&self) -> Vec<String> {
        self.entities.kinds().map(str::to_string).collect()
    }

    /// Starts a new snapshot: fresh id and timestamp.
    pub fn begin_snapshot(&mut self) {
        self.snapshot_id = snapshot_id();
        self.timestamp = now_millis();
    }

    /// Full snapshot, sent to clients on join.
    pub fn to_json(&self) -> Value {
        let players: Map<String, Value> = self
            .players
            .iter()
            .map(|(id, player)| (id.to_string(), player.to_json()))
            .collect();
        json!({
            "snapshotId": self.snapshot_id,
            "timestamp": self.timestamp,
            "players": players,
            "settings": self.settings,
            "entities": self.entities.to_json(),
        })
    }

    /// Drains change tracking into a `PATCH` frame, or `None` if nothing
    /// changed.
    pub fn take_patch(&mut self) -> Option<ServerMessage> {
        let players: IndexMap<SessionId, Value> = self
            .dirty_players
            .drain(..)
            .filter_map(|id| {
                let json = self.players.get(&id)?.to_json();
                Some((id, json))
            })
            .collect();
        let removed_players: Vec<SessionId> = self.removed_players.drain(..).collect();
        let entities = self.entities.take_patch();

        if players.is_empty() && removed_players.is_empty() && entities.is_empty() {
            return None;
        }
        Some(ServerMessage::Patch {
            snapshot_id: self.snapshot_id.clone(),
            timestamp: self.timestamp,
            players,
            removed_players,
            entities,
        })
    }
}

fn snapshot_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
