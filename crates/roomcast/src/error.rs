//! Unified error type for Roomcast.

use roomcast_protocol::ProtocolError;
use roomcast_room::RoomError;
use roomcast_rpc::RpcError;
use roomcast_schema::SchemaError;
use roomcast_session::SessionError;
use roomcast_transport::TransportError;
use roomcast_worker::WorkerError;

/// Top-level error that wraps every crate-specific error.
///
/// `#[from]` on each variant lets `?` convert sub-crate errors
/// automatically.
#[derive(Debug, thiserror::Error)]
pub enum RoomcastError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Room(#[from] RoomError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err: RoomcastError = TransportError::ConnectionClosed("gone".into()).into();
        assert!(matches!(err, RoomcastError::Transport(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err: RoomcastError = ProtocolError::InvalidMessage("bad".into()).into();
        assert!(matches!(err, RoomcastError::Protocol(_)));
    }

    #[test]
    fn test_from_session_error() {
        let err: RoomcastError = SessionError::InvalidToken.into();
        assert!(matches!(err, RoomcastError::Session(_)));
    }

    #[test]
    fn test_from_room_error_keeps_message() {
        let err: RoomcastError = RoomError::RoomFull { current: 2, max: 2 }.into();
        assert!(matches!(err, RoomcastError::Room(_)));
        assert_eq!(err.to_string(), "Room is full 2 >= 2");
    }

    #[test]
    fn test_from_worker_and_rpc_errors() {
        let err: RoomcastError = WorkerError::Call(RpcError::Remote("boom".into())).into();
        assert_eq!(err.to_string(), "boom");
        let err: RoomcastError = RpcError::Cancelled.into();
        assert!(matches!(err, RoomcastError::Rpc(_)));
        let err: RoomcastError = SchemaError::UnknownKind("orb".into()).into();
        assert!(matches!(err, RoomcastError::Schema(_)));
    }
}
