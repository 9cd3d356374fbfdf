//! Integration tests for the Roomcast server, handler, and full connection
//! flow over real WebSocket connections on loopback.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use roomcast::prelude::*;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

// =========================================================================
// Helpers
// =========================================================================

type ClientWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn game(multiplayer: Value) -> Value {
    json!({ "components": { "multiplayer": multiplayer } })
}

/// Starts a server on a random port; returns its address and room.
async fn start_server(config: ServerConfig, game_data: Value) -> (String, RoomHandle) {
    let server = RoomcastServer::builder(config.bind("127.0.0.1:0"))
        .room(RoomBuilder::new("it", game_data))
        .build()
        .await
        .expect("server should build");
    let addr = server.local_addr().expect("local addr").to_string();
    let room = server.room().clone();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    (addr, room)
}

async fn connect(addr: &str) -> ClientWs {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("should connect");
    ws
}

async fn send(ws: &mut ClientWs, msg: &ClientMessage) {
    let text = serde_json::to_string(msg).expect("encode");
    ws.send(Message::text(text)).await.expect("send");
}

/// Next server message that is not a ping or a patch. `None` on close.
async fn next_message(ws: &mut ClientWs) -> Option<ServerMessage> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("server should answer in time")?;
        match frame.ok()? {
            Message::Text(text) => {
                let msg: ServerMessage = serde_json::from_str(text.as_str()).expect("decode");
                if !matches!(msg, ServerMessage::Ping { .. } | ServerMessage::Patch { .. }) {
                    return Some(msg);
                }
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
}

/// Connects and joins; returns the socket, session id, and token.
async fn join(addr: &str, options: Value) -> (ClientWs, SessionId, String) {
    let mut ws = connect(addr).await;
    send(
        &mut ws,
        &ClientMessage::Join {
            options,
            reconnect_token: None,
        },
    )
    .await;
    match next_message(&mut ws).await {
        Some(ServerMessage::Joined {
            session_id,
            reconnect_token,
            state,
        }) => {
            assert!(state["players"][session_id.as_str()].is_object());
            (ws, session_id, reconnect_token)
        }
        other => panic!("expected JOINED, got {other:?}"),
    }
}

async fn wait_for_players(room: &RoomHandle, expected: usize) {
    for _ in 0..100 {
        if matches!(room.info().await, Ok(info) if info.player_count == expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room never reached {expected} players");
}

// =========================================================================
// Handshake
// =========================================================================

#[tokio::test]
async fn test_join_returns_session_and_snapshot() {
    let (addr, room) = start_server(ServerConfig::default(), game(json!({}))).await;
    let (_ws, session_id, token) = join(&addr, json!({ "username": "ada" })).await;

    assert!(!token.is_empty());
    let info = room.info().await.unwrap();
    assert_eq!(info.player_count, 1);
    assert_eq!(info.host, Some(session_id));
}

#[tokio::test]
async fn test_first_frame_must_be_join() {
    let (addr, _room) = start_server(ServerConfig::default(), game(json!({}))).await;
    let mut ws = connect(&addr).await;
    send(&mut ws, &ClientMessage::Ping { data: json!(1) }).await;

    assert_eq!(next_message(&mut ws).await, Some(ServerMessage::error(400, "expected JOIN")));
    assert_eq!(next_message(&mut ws).await, None);
}

#[tokio::test]
async fn test_garbage_first_frame_rejected() {
    let (addr, _room) = start_server(ServerConfig::default(), game(json!({}))).await;
    let mut ws = connect(&addr).await;
    ws.send(Message::text("not json")).await.unwrap();

    assert!(matches!(next_message(&mut ws).await, Some(ServerMessage::Error { code: 400, .. })));
}

#[tokio::test]
async fn test_full_room_rejects_with_409() {
    let (addr, _room) = start_server(ServerConfig::default(), game(json!({ "maxPlayers": 2 }))).await;
    let _a = join(&addr, Value::Null).await;
    let _b = join(&addr, Value::Null).await;

    let mut ws = connect(&addr).await;
    send(
        &mut ws,
        &ClientMessage::Join {
            options: Value::Null,
            reconnect_token: None,
        },
    )
    .await;
    assert_eq!(next_message(&mut ws).await, Some(ServerMessage::error(409, "Room is full 2 >= 2")));
    assert_eq!(next_message(&mut ws).await, None);
}

// =========================================================================
// Reconnection
// =========================================================================

#[tokio::test]
async fn test_reconnect_token_resumes_session() {
    let (addr, room) = start_server(ServerConfig::default(), game(json!({ "reconnectTimeout": 5 }))).await;
    let (ws, session_id, token) = join(&addr, Value::Null).await;

    // Drop the socket without a close frame.
    drop(ws);
    for _ in 0..100 {
        if room.info().await.unwrap().connected == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(room.info().await.unwrap().player_count, 1);

    let mut ws = connect(&addr).await;
    send(
        &mut ws,
        &ClientMessage::Join {
            options: Value::Null,
            reconnect_token: Some(token.clone()),
        },
    )
    .await;
    match next_message(&mut ws).await {
        Some(ServerMessage::Joined {
            session_id: resumed,
            reconnect_token,
            ..
        }) => {
            assert_eq!(resumed, session_id);
            assert_eq!(reconnect_token, token);
        }
        other => panic!("expected JOINED, got {other:?}"),
    }
    assert_eq!(room.info().await.unwrap().connected, 1);
}

#[tokio::test]
async fn test_unknown_reconnect_token_rejected() {
    let (addr, _room) = start_server(ServerConfig::default(), game(json!({ "reconnectTimeout": 5 }))).await;
    let mut ws = connect(&addr).await;
    send(
        &mut ws,
        &ClientMessage::Join {
            options: Value::Null,
            reconnect_token: Some("nope".into()),
        },
    )
    .await;
    assert!(matches!(next_message(&mut ws).await, Some(ServerMessage::Error { code: 404, .. })));
}

#[tokio::test]
async fn test_clean_close_leaves_immediately() {
    let (addr, room) = start_server(ServerConfig::default(), game(json!({ "reconnectTimeout": 30 }))).await;
    let (mut ws, _id, _token) = join(&addr, Value::Null).await;

    ws.close(None).await.unwrap();
    wait_for_players(&room, 0).await;
}

// =========================================================================
// Routing
// =========================================================================

#[tokio::test]
async fn test_broadcast_reaches_other_player() {
    let (addr, _room) = start_server(ServerConfig::default(), game(json!({}))).await;
    let (mut a, _, _) = join(&addr, Value::Null).await;
    let (mut b, _, _) = join(&addr, Value::Null).await;

    send(
        &mut a,
        &ClientMessage::GameMessage {
            data: json!({ "type": "broadcast", "text": "hello" }),
        },
    )
    .await;
    assert_eq!(
        next_message(&mut b).await,
        Some(ServerMessage::RoomMessage {
            data: json!({ "type": "broadcast", "text": "hello" }),
        })
    );
}

#[tokio::test]
async fn test_undecodable_frame_gets_400_and_connection_stays_open() {
    let (addr, _room) = start_server(ServerConfig::default(), game(json!({}))).await;
    let (mut ws, _, _) = join(&addr, Value::Null).await;

    ws.send(Message::text(r#"{"type":"TELEPORT"}"#)).await.unwrap();
    assert!(matches!(next_message(&mut ws).await, Some(ServerMessage::Error { code: 400, .. })));

    send(&mut ws, &ClientMessage::Ping { data: json!("still here") }).await;
    assert_eq!(next_message(&mut ws).await, Some(ServerMessage::Pong { data: json!("still here") }));
}

#[tokio::test]
async fn test_silent_client_times_out() {
    let config = ServerConfig::default().receive_timeout(Duration::from_millis(200));
    let (addr, room) = start_server(config, game(json!({}))).await;
    let (_ws, _, _) = join(&addr, Value::Null).await;

    wait_for_players(&room, 1).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    wait_for_players(&room, 0).await;
}

// =========================================================================
// Idle shutdown
// =========================================================================

#[tokio::test]
async fn test_idle_room_stops_server() {
    let config = ServerConfig::default()
        .bind("127.0.0.1:0")
        .idle_timeout(Duration::from_millis(100));
    let server = RoomcastServer::builder(config)
        .room(RoomBuilder::new("idle", game(json!({}))))
        .build()
        .await
        .unwrap();
    let room = server.room().clone();

    tokio::time::timeout(Duration::from_secs(5), server.run())
        .await
        .expect("server should stop on its own")
        .unwrap();
    assert!(room.info().await.is_err());
}
