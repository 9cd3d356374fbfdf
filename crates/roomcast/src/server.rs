//! `RoomcastServer` builder and server loop.
//!
//! Ties the layers together: transport → protocol → room. One server
//! hosts exactly one room and exits once the room has been idle for
//! [`ServerConfig::idle_timeout`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use roomcast_protocol::JsonCodec;
use roomcast_room::{RoomBuilder, RoomHandle};
use roomcast_session::{SessionConfig, SessionManager};
use roomcast_transport::{Transport, WebSocketTransport};
use tokio::sync::{Mutex, watch};

use crate::handler::handle_connection;
use crate::{RoomcastError, ServerConfig};

/// Shared server state passed to each connection handler task.
pub(crate) struct ServerState {
    pub(crate) room: RoomHandle,
    pub(crate) sessions: Mutex<SessionManager>,
    pub(crate) codec: JsonCodec,
    pub(crate) config: ServerConfig,
}

/// Builder for configuring and starting a Roomcast server.
pub struct RoomcastServerBuilder {
    config: ServerConfig,
    room: Option<RoomBuilder>,
}

impl RoomcastServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, room: None }
    }

    /// The room this server hosts.
    pub fn room(mut self, room: RoomBuilder) -> Self {
        self.room = Some(room);
        self
    }

    /// Creates the room and binds the listener.
    ///
    /// Without a [`room`](Self::room) a room named `"default"` with empty
    /// game data is created.
    ///
    /// # Errors
    /// Room creation failures (including a simulation that fails to load)
    /// and bind failures.
    pub async fn build(self) -> Result<RoomcastServer, RoomcastError> {
        let room = self
            .room
            .unwrap_or_else(|| RoomBuilder::new("default", serde_json::Value::Null))
            .spawn()
            .await?;
        let transport = WebSocketTransport::bind(&self.config.bind_addr)
            .await?
            .with_max_frame(self.config.max_frame);

        let state = Arc::new(ServerState {
            room,
            sessions: Mutex::new(SessionManager::new(SessionConfig::default())),
            codec: JsonCodec,
            config: self.config,
        });
        Ok(RoomcastServer { transport, state })
    }
}

/// A running Roomcast server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct RoomcastServer {
    transport: WebSocketTransport,
    state: Arc<ServerState>,
}

impl RoomcastServer {
    pub fn builder(config: ServerConfig) -> RoomcastServerBuilder {
        RoomcastServerBuilder::new(config)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RoomcastError> {
        Ok(self.transport.local_addr()?)
    }

    /// The hosted room.
    pub fn room(&self) -> &RoomHandle {
        &self.state.room
    }

    /// Accepts connections until the room has gone idle, then shuts the
    /// room down.
    pub async fn run(mut self) -> Result<(), RoomcastError> {
        let room_id = self.state.room.room_id().to_string();
        tracing::info!(%room_id, addr = ?self.transport.local_addr().ok(), "roomcast server running");

        let idle = idle_elapsed(self.state.room.connected(), self.state.config.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn, state).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "accept failed"),
                },
                () = &mut idle => {
                    tracing::info!(%room_id, "room idle, shutting down");
                    break;
                }
            }
        }

        // The actor may already be gone if it stopped on its own.
        if let Err(e) = self.state.room.shutdown().await {
            tracing::debug!(%room_id, error = %e, "room already stopped");
        }
        Ok(())
    }
}

/// Resolves once the connected count has stayed at zero for `timeout`, or
/// when the room stops publishing the count.
async fn idle_elapsed(mut connected: watch::Receiver<usize>, timeout: Duration) {
    loop {
        if *connected.borrow_and_update() == 0 {
            tokio::select! {
                () = tokio::time::sleep(timeout) => return,
                changed = connected.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        } else if connected.changed().await.is_err() {
            return;
        }
    }
}
