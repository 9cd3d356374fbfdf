//! Integration tests for the WebSocket transport.
//!
//! A real server and client on loopback; the server binds port 0 and the
//! client connects to whatever port the OS picked.

#[cfg(feature = "websocket")]
mod websocket {
    use futures_util::{SinkExt, StreamExt};
    use roomcast_transport::{CloseReason, Connection, Transport, TransportError, WebSocketTransport};
    use tokio_tungstenite::tungstenite::Message;

    type ClientWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn pair(transport: WebSocketTransport) -> (roomcast_transport::WebSocketConnection, ClientWs) {
        let mut transport = transport;
        let addr = transport.local_addr().expect("bound address");
        let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .expect("client should connect");
        (server.await.expect("accept task"), client)
    }

    async fn bound() -> WebSocketTransport {
        WebSocketTransport::bind("127.0.0.1:0").await.expect("should bind")
    }

    #[tokio::test]
    async fn test_websocket_send_and_receive() {
        let (conn, mut client) = pair(bound().await).await;
        assert!(conn.id().into_inner() > 0);

        conn.send(r#"{"type":"PING","data":1}"#).await.unwrap();
        let msg = client.next().await.unwrap().unwrap();
        assert!(msg.is_text());
        assert_eq!(msg.into_text().unwrap().as_str(), r#"{"type":"PING","data":1}"#);

        client.send(Message::text(r#"{"type":"PONG","data":1}"#)).await.unwrap();
        let received = conn.recv().await.unwrap().expect("a frame");
        assert_eq!(received, br#"{"type":"PONG","data":1}"#);

        client.send(Message::Binary(b"raw".to_vec().into())).await.unwrap();
        assert_eq!(conn.recv().await.unwrap().unwrap(), b"raw");
    }

    #[tokio::test]
    async fn test_websocket_send_while_receiving() {
        let (conn, mut client) = pair(bound().await).await;
        let conn = std::sync::Arc::new(conn);

        let reader = {
            let conn = std::sync::Arc::clone(&conn);
            tokio::spawn(async move { conn.recv().await })
        };
        tokio::task::yield_now().await;

        // The reader is parked in recv; sending must not wait for it.
        tokio::time::timeout(std::time::Duration::from_secs(2), conn.send("hello"))
            .await
            .expect("send should not block on a pending recv")
            .unwrap();
        assert_eq!(client.next().await.unwrap().unwrap().into_text().unwrap().as_str(), "hello");

        client.send(Message::text("bye")).await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap().unwrap(), b"bye");
    }

    #[tokio::test]
    async fn test_websocket_recv_returns_none_on_client_close() {
        let (conn, mut client) = pair(bound().await).await;
        client.send(Message::Close(None)).await.unwrap();

        let result = conn.recv().await.expect("recv should not error");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_websocket_close_sends_code() {
        let (conn, mut client) = pair(bound().await).await;
        conn.close(CloseReason::Kicked).await.unwrap();

        match client.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 4000);
                assert_eq!(frame.reason.as_str(), "removed from room");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_websocket_oversized_frame_rejected() {
        let (conn, mut client) = pair(bound().await.with_max_frame(8)).await;
        client.send(Message::text("0123456789")).await.unwrap();

        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { size: 10, limit: 8 }));
    }
}
