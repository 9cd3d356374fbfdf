//! Room configuration and lifecycle phase.

use std::time::Duration;

use roomcast_protocol::Vec3;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// RoomConfig
// ---------------------------------------------------------------------------

/// Settings for one room, read from the game's `components.multiplayer`.
///
/// Every numeric field is clamped into its allowed range; a missing,
/// non-numeric, or NaN value falls back to the default. Building a config
/// never fails.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomConfig {
    /// Simulation ticks per second, 1–60.
    pub tick_rate: u32,
    /// Patches sent to clients per second, 1–20.
    pub patch_rate: u32,
    /// 2–500.
    pub max_players: usize,
    /// Grace window for a dropped connection, 0–60 s. Zero means a
    /// disconnect is an immediate leave.
    pub reconnect_timeout: Duration,
    /// The server owns player transforms; client `position`/`rotation`
    /// updates are ignored.
    pub authoritative_position: bool,
    /// Run the game's server-side simulation behind the worker proxy.
    pub server_engine: bool,
    /// Start the game (no countdown) as soon as the first player joins.
    pub auto_start: bool,
    /// Accept joins after the game has started.
    pub join_after_start: bool,
    /// Liveness probe period while running. Idle rooms probe every second.
    pub ping_interval: Duration,
    /// Samples kept per player for latency smoothing.
    pub latency_window: usize,
    /// Where joining players are placed under authoritative position.
    pub spawn: Option<SpawnPoint>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            tick_rate: 20,
            patch_rate: 20,
            max_players: 500,
            reconnect_timeout: Duration::ZERO,
            authoritative_position: false,
            server_engine: false,
            auto_start: false,
            join_after_start: true,
            ping_interval: Duration::from_millis(5000),
            latency_window: 10,
            spawn: None,
        }
    }
}

impl RoomConfig {
    /// Probe period for rooms that aren't running.
    pub const IDLE_PING_INTERVAL: Duration = Duration::from_millis(1000);

    /// Reads `components.multiplayer` and `components.spawn` from a game
    /// descriptor.
    pub fn from_game_data(game_data: &Value) -> Self {
        let defaults = Self::default();
        let components = &game_data["components"];
        let settings = &components["multiplayer"];

        let number = |key: &str, default: f64, min: f64, max: f64| {
            clamp_setting(settings.get(key), default, min, max)
        };
        let flag = |key: &str, default: bool| settings.get(key).and_then(Value::as_bool).unwrap_or(default);

        Self {
            tick_rate: number("tickRate", f64::from(defaults.tick_rate), 1.0, 60.0) as u32,
            patch_rate: number("patchRate", f64::from(defaults.patch_rate), 1.0, 20.0) as u32,
            max_players: number("maxPlayers", defaults.max_players as f64, 2.0, 500.0) as usize,
            reconnect_timeout: Duration::from_secs_f64(number("reconnectTimeout", 0.0, 0.0, 60.0)),
            authoritative_position: flag("authoritativePosition", defaults.authoritative_position),
            server_engine: flag("serverEngine", defaults.server_engine),
            auto_start: flag("autoStart", defaults.auto_start),
            join_after_start: flag("joinAfterStart", defaults.join_after_start),
            ping_interval: Duration::from_millis(number("pingInterval", 5000.0, 250.0, 60_000.0) as u64),
            latency_window: number("latencyWindow", defaults.latency_window as f64, 1.0, 100.0) as usize,
            spawn: SpawnPoint::from_value(&components["spawn"]),
        }
    }
}

/// Clamps a numeric setting into `[min, max]`.
///
/// Anything that isn't a finite JSON number (absent, string, null, NaN)
/// yields `default`.
pub fn clamp_setting(value: Option<&Value>, default: f64, min: f64, max: f64) -> f64 {
    match value.and_then(Value::as_f64) {
        Some(v) if !v.is_nan() => v.clamp(min, max),
        _ => default,
    }
}

/// Initial transform for joining players.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpawnPoint {
    pub position: Vec3,
    pub rotation: Vec3,
}

impl SpawnPoint {
    /// Reads `{position, rotation}`. Missing parts default to the origin;
    /// anything that isn't an object yields `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        let vec = |v: &Value| serde_json::from_value::<Vec3>(v.clone()).unwrap_or_default();
        Some(Self {
            position: vec(&value["position"]),
            rotation: vec(&value["rotation"]),
        })
    }
}

// ---------------------------------------------------------------------------
// RoomPhase
// ---------------------------------------------------------------------------

/// Where a room is in its lifecycle.
///
/// ```text
/// Created → Idle → Countdown → Running → Stopped
///             ↑                            │
///             └──────── (start again) ─────┘
/// ```
///
/// Disposal is orthogonal: any phase can end in a disposed room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomPhase {
    Created,
    Idle,
    Countdown,
    Running,
    Stopped,
}

impl RoomPhase {
    /// Returns `true` once a start has been requested and not stopped.
    pub fn is_started(self) -> bool {
        matches!(self, Self::Countdown | Self::Running)
    }

    /// Returns `true` if a start request is allowed now.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Stopped)
    }
}

impl std::fmt::Display for RoomPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Idle => "idle",
            Self::Countdown => "countdown",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
