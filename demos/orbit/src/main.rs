use std::f64::consts::TAU;
use std::time::Duration;

use indexmap::IndexMap;
use roomcast::prelude::*;
use serde::Deserialize;
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Game types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct SatelliteSpec {
    id: String,
    radius: f64,
    /// Revolutions per second.
    speed: f64,
}

#[derive(Debug, Clone)]
struct Satellite {
    radius: f64,
    speed: f64,
    angle: f64,
    claimed_by: Option<SessionId>,
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Satellites circle the origin while the game runs. Players claim them
/// with a `claim` message; a player's claims are released when they leave.
#[derive(Default)]
struct Orbit {
    satellites: IndexMap<String, Satellite>,
}

impl Orbit {
    fn claimed_by(&self, session_id: &SessionId) -> usize {
        self.satellites
            .values()
            .filter(|s| s.claimed_by.as_ref() == Some(session_id))
            .count()
    }
}

impl Simulation for Orbit {
    fn load(&mut self, game_data: &Value, _ctx: &mut SimContext) -> Result<IndexMap<String, EntityDeclaration>, String> {
        let specs: Vec<SatelliteSpec> =
            serde_json::from_value(game_data["satellites"].clone()).map_err(|e| format!("bad satellites: {e}"))?;
        for spec in specs {
            let satellite = Satellite {
                radius: spec.radius,
                speed: spec.speed,
                angle: 0.0,
                claimed_by: None,
            };
            self.satellites.insert(spec.id, satellite);
        }
        tracing::info!(satellites = self.satellites.len(), "orbit loaded");

        let mut kinds = IndexMap::new();
        kinds.insert(
            "satellite".to_string(),
            EntityDeclaration::object([
                ("position", EntityDeclaration::Vec2),
                ("radius", EntityDeclaration::Number(0.0)),
                ("claimedBy", EntityDeclaration::String(String::new())),
            ]),
        );
        Ok(kinds)
    }

    fn on_leave(&mut self, player: &Value, _ctx: &mut SimContext) {
        let Some(session_id) = player["sessionId"].as_str() else {
            return;
        };
        for satellite in self.satellites.values_mut() {
            if satellite.claimed_by.as_ref().is_some_and(|c| c.as_str() == session_id) {
                satellite.claimed_by = None;
            }
        }
    }

    fn on_message(&mut self, message_type: &str, payload: &Value, session_id: &SessionId, ctx: &mut SimContext) {
        if message_type != "claim" {
            return;
        }
        let Some(id) = payload["id"].as_str() else {
            ctx.api.send("claimRejected", json!({ "reason": "missing id" }), session_id.clone());
            return;
        };
        match self.satellites.get_mut(id) {
            Some(satellite) if satellite.claimed_by.is_none() => {
                satellite.claimed_by = Some(session_id.clone());
                ctx.api.broadcast("claimed", json!({ "id": id, "by": session_id }), Vec::new());
            }
            Some(_) => ctx.api.send("claimRejected", json!({ "id": id, "reason": "taken" }), session_id.clone()),
            None => ctx.api.send("claimRejected", json!({ "id": id, "reason": "unknown" }), session_id.clone()),
        }
    }

    fn update(&mut self, dt: Duration, _ctx: &mut SimContext) {
        for satellite in self.satellites.values_mut() {
            satellite.angle = (satellite.angle + satellite.speed * TAU * dt.as_secs_f64()) % TAU;
        }
    }

    fn net_state(&mut self, _ctx: &mut SimContext) -> NetState {
        let records = self
            .satellites
            .iter()
            .map(|(id, s)| {
                let record = json!({
                    "position": { "x": s.radius * s.angle.cos(), "y": s.radius * s.angle.sin() },
                    "radius": s.radius,
                    "claimedBy": s.claimed_by.as_ref().map(SessionId::as_str).unwrap_or_default(),
                });
                (id.clone(), record)
            })
            .collect();
        let mut state = NetState::new();
        state.insert("satellite".to_string(), records);
        state
    }

    fn rpc(&mut self, request: &Value, session_id: &SessionId, _ctx: &mut SimContext) -> Result<Value, String> {
        match request["method"].as_str() {
            Some("myClaims") => Ok(json!(self.claimed_by(session_id))),
            _ => Err("Rpc method not found".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Server bootstrap
// ---------------------------------------------------------------------------

fn game_data() -> Value {
    json!({
        "components": {
            "multiplayer": {
                "serverEngine": true,
                "autoStart": true,
                "tickRate": 30,
                "patchRate": 15,
                "maxPlayers": 16,
                "reconnectTimeout": 10
            }
        },
        "satellites": [
            { "id": "io", "radius": 4.0, "speed": 0.5 },
            { "id": "europa", "radius": 7.0, "speed": 0.25 },
            { "id": "ganymede", "radius": 11.0, "speed": 0.1 }
        ]
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    roomcast::init_tracing();

    let server = RoomcastServer::builder(ServerConfig::from_env())
        .room(RoomBuilder::new("orbit", game_data()).simulation(Orbit::default()))
        .build()
        .await?;
    tracing::info!(addr = %server.local_addr()?, "orbit demo listening");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }
    Ok(())
}
