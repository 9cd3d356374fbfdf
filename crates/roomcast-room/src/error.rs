//! Error types for the room layer.

use roomcast_protocol::{ServerMessage, SessionId};
use roomcast_schema::SchemaError;
use roomcast_worker::WorkerError;

/// Errors that can occur during room operations.
///
/// Validation errors carry the message clients see; [`code`](Self::code)
/// maps each variant to the HTTP-style code of the `ERROR` frame.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// No free player slot.
    #[error("Room is full {current} >= {max}")]
    RoomFull { current: usize, max: usize },

    /// The game is running and the room doesn't accept late joins.
    #[error("Game already started")]
    AlreadyStarted,

    /// No player with this session id is in the room.
    #[error("player {0} not in room")]
    PlayerNotFound(SessionId),

    /// The session id is already in the room.
    #[error("player {0} already in room")]
    AlreadyJoined(SessionId),

    /// The room's phase doesn't allow this operation.
    #[error("invalid room state for this operation: {0}")]
    InvalidState(String),

    /// A client frame was well-formed JSON but semantically wrong.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The executor failed to load, sync, or answer.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// An entity declaration or record didn't fit the registry.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The room actor is gone or its channel is closed.
    #[error("room {0} is unavailable")]
    Unavailable(String),
}

impl RoomError {
    /// HTTP-style status for the client-facing `ERROR` frame.
    pub fn code(&self) -> u16 {
        match self {
            Self::InvalidMessage(_) => 400,
            Self::AlreadyStarted | Self::InvalidState(_) => 403,
            Self::PlayerNotFound(_) => 404,
            Self::RoomFull { .. } | Self::AlreadyJoined(_) => 409,
            Self::Worker(_) | Self::Schema(_) | Self::Unavailable(_) => 500,
        }
    }
}

impl From<&RoomError> for ServerMessage {
    fn from(err: &RoomError) -> Self {
        ServerMessage::error(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_full_message() {
        let err = RoomError::RoomFull { current: 2, max: 2 };
        assert_eq!(err.to_string(), "Room is full 2 >= 2");
        assert_eq!(err.code(), 409);
    }

    #[test]
    fn test_error_to_server_message() {
        let msg = ServerMessage::from(&RoomError::AlreadyStarted);
        assert_eq!(msg, ServerMessage::error(403, "Game already started"));
    }
}
