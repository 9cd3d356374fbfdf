//! WebSocket transport implementation using `tokio-tungstenite`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::{CloseReason, Connection, ConnectionId, Transport, TransportError};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Frames above this size are rejected unless configured otherwise.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;

type WsStream = WebSocketStream<TcpStream>;

/// A WebSocket-based [`Transport`] that listens for incoming connections.
pub struct WebSocketTransport {
    listener: TcpListener,
    max_frame: usize,
}

impl WebSocketTransport {
    /// Binds a new WebSocket transport to the given address.
    ///
    /// Port `0` picks a free port; read it back with
    /// [`local_addr`](Transport::local_addr).
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(TransportError::AcceptFailed)?;
        let local = listener.local_addr().map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr = %local, "WebSocket transport listening");
        Ok(Self {
            listener,
            max_frame: DEFAULT_MAX_FRAME,
        })
    }

    /// Sets the largest frame a connection accepts.
    pub fn with_max_frame(mut self, bytes: usize) -> Self {
        self.max_frame = bytes;
        self
    }
}

impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<Self::Connection, Self::Error> {
        let (stream, addr) = self.listener.accept().await.map_err(TransportError::AcceptFailed)?;
        stream.set_nodelay(true).map_err(TransportError::AcceptFailed)?;

        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| TransportError::AcceptFailed(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e)))?;

        let id = ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%id, %addr, "accepted WebSocket connection");

        let (sink, stream) = ws.split();
        Ok(WebSocketConnection {
            id,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            max_frame: self.max_frame,
        })
    }

    fn local_addr(&self) -> Result<SocketAddr, Self::Error> {
        self.listener.local_addr().map_err(TransportError::AcceptFailed)
    }
}

/// A single WebSocket connection.
///
/// The socket is split so the writer task and the reader task never
/// contend for the same lock.
pub struct WebSocketConnection {
    id: ConnectionId,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    max_frame: usize,
}

fn broken_pipe(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    TransportError::SendFailed(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
}

impl Connection for WebSocketConnection {
    type Error = TransportError;

    async fn send(&self, data: &str) -> Result<(), Self::Error> {
        self.sink.lock().await.send(Message::text(data)).await.map_err(broken_pipe)
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        let mut stream = self.stream.lock().await;
        loop {
            let data: Vec<u8> = match stream.next().await {
                Some(Ok(Message::Binary(data))) => data.into(),
                Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // ping/pong/raw frames are handled by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
            };
            if data.len() > self.max_frame {
                return Err(TransportError::FrameTooLarge {
                    size: data.len(),
                    limit: self.max_frame,
                });
            }
            return Ok(Some(data));
        }
    }

    async fn close(&self, reason: CloseReason) -> Result<(), Self::Error> {
        let frame = CloseFrame {
            code: CloseCode::from(reason.code()),
            reason: reason.as_str().into(),
        };
        let mut sink = self.sink.lock().await;
        match sink.send(Message::Close(Some(frame))).await {
            Ok(()) => {}
            // Peer already gone.
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => return Ok(()),
            Err(e) => return Err(broken_pipe(e)),
        }
        sink.close().await.or_else(|e| match e {
            tokio_tungstenite::tungstenite::Error::ConnectionClosed => Ok(()),
            e => Err(broken_pipe(e)),
        })
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}
