//! Per-connection handler: `JOIN` handshake, reconnect tokens, and
//! message routing into the room.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Receive `JOIN` → join the room, or resume with a reconnect token
//!   2. Send `JOINED` with the session id, token and a full snapshot
//!   3. A writer task drains the room's outbound channel into the socket
//!   4. Loop: receive frames → decode → forward to the room
//!   5. On exit, a drop guard reports the disconnect to the room

use std::sync::Arc;

use rand::Rng;
use rand::distr::Alphanumeric;
use roomcast_protocol::{ClientMessage, Codec, JsonCodec, ProtocolError, ServerMessage, SessionId};
use roomcast_room::{PlayerSender, RoomError, RoomOutbound};
use roomcast_session::SessionError;
use roomcast_transport::{CloseReason, Connection, WebSocketConnection};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::RoomcastError;
use crate::server::ServerState;

const SESSION_ID_LEN: usize = 9;

/// Reports the disconnect to the room when the handler exits.
///
/// Runs even if the handler panics. `Drop` is synchronous, so the async
/// work goes to a fire-and-forget task.
struct DisconnectGuard {
    session_id: SessionId,
    state: Arc<ServerState>,
    /// The client closed the socket itself; skip the reconnect window.
    consented: bool,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let session_id = self.session_id.clone();
        let state = Arc::clone(&self.state);
        let consented = self.consented;
        tokio::spawn(async move {
            let outcome = state.room.disconnect(session_id.clone(), consented).await;
            let mut sessions = state.sessions.lock().await;
            match outcome {
                Ok(grace) if !grace.is_zero() => {
                    sessions.set_reconnect_grace(grace);
                    let _ = sessions.disconnect(&session_id);
                }
                Ok(_) => {
                    sessions.remove(&session_id);
                }
                Err(e) => {
                    tracing::debug!(%session_id, error = %e, "disconnect after removal");
                    sessions.remove(&session_id);
                }
            }
            sessions.expire_stale();
            sessions.cleanup_expired();
        });
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection(conn: WebSocketConnection, state: Arc<ServerState>) -> Result<(), RoomcastError> {
    let conn_id = conn.id();
    let conn = Arc::new(conn);
    tracing::debug!(%conn_id, "handling new connection");

    let (tx, rx) = mpsc::unbounded_channel();
    let (session_id, joined) = perform_handshake(&conn, &state, tx.clone()).await?;
    let mut guard = DisconnectGuard {
        session_id: session_id.clone(),
        state: Arc::clone(&state),
        consented: false,
    };
    conn.send(&encode(&state.codec, &joined)?).await?;
    tracing::info!(%conn_id, %session_id, "player connected");

    let mut writer = tokio::spawn(write_loop(Arc::clone(&conn), rx, state.codec));

    loop {
        tokio::select! {
            received = tokio::time::timeout(state.config.receive_timeout, conn.recv()) => {
                let data = match received {
                    Ok(Ok(Some(data))) => data,
                    Ok(Ok(None)) => {
                        tracing::info!(%session_id, "connection closed by client");
                        guard.consented = true;
                        break;
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(%session_id, error = %e, "recv error");
                        break;
                    }
                    Err(_) => {
                        tracing::info!(%session_id, "connection timed out");
                        break;
                    }
                };

                let msg: ClientMessage = match state.codec.decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!(%session_id, error = %e, "undecodable client frame");
                        let _ = tx.send(RoomOutbound::Message(ServerMessage::error(400, format!("invalid message: {e}"))));
                        continue;
                    }
                };
                if matches!(msg, ClientMessage::Join { .. }) {
                    tracing::warn!(%session_id, "duplicate JOIN, ignoring");
                    continue;
                }
                if let Err(e) = state.room.send(session_id.clone(), msg).await {
                    tracing::debug!(%session_id, error = %e, "room unavailable");
                    break;
                }
            }
            _ = &mut writer => {
                tracing::debug!(%session_id, "room closed the connection");
                break;
            }
        }
    }

    writer.abort();
    // guard drops here → room disconnect fires.
    Ok(())
}

/// Receives the `JOIN` frame and admits the player. Returns the session
/// id and the `JOINED` reply to send.
///
/// On failure the client gets an `ERROR` frame and the socket is closed.
async fn perform_handshake(
    conn: &WebSocketConnection,
    state: &ServerState,
    tx: PlayerSender,
) -> Result<(SessionId, ServerMessage), RoomcastError> {
    let data = match tokio::time::timeout(state.config.handshake_timeout, conn.recv()).await {
        Ok(Ok(Some(data))) => data,
        Ok(Ok(None)) => {
            return Err(ProtocolError::InvalidMessage("connection closed before JOIN".into()).into());
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            let _ = conn.close(CloseReason::Policy).await;
            return Err(ProtocolError::InvalidMessage("handshake timed out".into()).into());
        }
    };

    let (options, reconnect_token) = match state.codec.decode::<ClientMessage>(&data) {
        Ok(ClientMessage::Join {
            options,
            reconnect_token,
        }) => (options, reconnect_token),
        Ok(other) => {
            reject(conn, &state.codec, ServerMessage::error(400, "expected JOIN"), CloseReason::Policy).await;
            return Err(ProtocolError::InvalidMessage(format!("first message must be JOIN, got {}", other.kind())).into());
        }
        Err(e) => {
            reject(conn, &state.codec, ServerMessage::error(400, format!("invalid message: {e}")), CloseReason::Policy).await;
            return Err(e.into());
        }
    };

    let admitted = match reconnect_token {
        Some(token) => resume(state, &token, tx).await,
        None => join(state, options, tx).await,
    };
    let (session_id, reconnect_token, snapshot) = match admitted {
        Ok(admitted) => admitted,
        Err((reply, e)) => {
            reject(conn, &state.codec, reply, CloseReason::Rejected).await;
            return Err(e);
        }
    };

    let joined = ServerMessage::Joined {
        session_id: session_id.clone(),
        reconnect_token,
        state: snapshot,
    };
    Ok((session_id, joined))
}

type Admitted = (SessionId, String, Value);
type Refused = (ServerMessage, RoomcastError);

async fn join(state: &ServerState, options: Value, tx: PlayerSender) -> Result<Admitted, Refused> {
    let session_id = new_session_id();
    let snapshot = state
        .room
        .join(session_id.clone(), options, tx)
        .await
        .map_err(|e| (ServerMessage::from(&e), e.into()))?;

    let token = state
        .sessions
        .lock()
        .await
        .create(session_id.clone())
        .map(|session| session.reconnect_token.clone());
    match token {
        Ok(token) => Ok((session_id, token, snapshot)),
        Err(e) => {
            let _ = state.room.leave(session_id).await;
            Err((ServerMessage::error(500, e.to_string()), e.into()))
        }
    }
}

async fn resume(state: &ServerState, token: &str, tx: PlayerSender) -> Result<Admitted, Refused> {
    let session_id = state
        .sessions
        .lock()
        .await
        .reconnect(token)
        .map(|session| session.session_id.clone())
        .map_err(|e| (session_refusal(&e), RoomcastError::from(e)))?;

    match state.room.reconnect(session_id.clone(), tx).await {
        Ok(snapshot) => {
            tracing::info!(%session_id, "session resumed");
            Ok((session_id, token.to_string(), snapshot))
        }
        Err(e) => {
            if matches!(e, RoomError::PlayerNotFound(_)) {
                state.sessions.lock().await.remove(&session_id);
            }
            Err((ServerMessage::from(&e), e.into()))
        }
    }
}

fn session_refusal(e: &SessionError) -> ServerMessage {
    let code = match e {
        SessionError::AlreadyConnected(_) => 409,
        SessionError::NotFound(_) | SessionError::InvalidToken | SessionError::SessionExpired(_) => 404,
    };
    ServerMessage::error(code, e.to_string())
}

/// Forwards room output to the socket until the room closes the player.
async fn write_loop(conn: Arc<WebSocketConnection>, mut rx: mpsc::UnboundedReceiver<RoomOutbound>, codec: JsonCodec) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            RoomOutbound::Message(msg) => {
                let text = match encode(&codec, &msg) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to encode server message");
                        continue;
                    }
                };
                if let Err(e) = conn.send(&text).await {
                    tracing::debug!(conn_id = %conn.id(), error = %e, "send failed");
                    return;
                }
            }
            RoomOutbound::Close => {
                let _ = conn.close(CloseReason::Kicked).await;
                return;
            }
        }
    }
}

async fn reject(conn: &WebSocketConnection, codec: &JsonCodec, reply: ServerMessage, reason: CloseReason) {
    if let Ok(text) = encode(codec, &reply) {
        let _ = conn.send(&text).await;
    }
    let _ = conn.close(reason).await;
}

fn encode(codec: &JsonCodec, msg: &ServerMessage) -> Result<String, RoomcastError> {
    let bytes = codec.encode(msg)?;
    String::from_utf8(bytes).map_err(|e| ProtocolError::InvalidMessage(format!("non UTF-8 frame: {e}")).into())
}

fn new_session_id() -> SessionId {
    let id: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect();
    SessionId::new(id)
}
