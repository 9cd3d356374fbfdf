//! Error types for the protocol layer.
//!
//! Each crate in Roomcast defines its own error enum. A `ProtocolError`
//! always means the bytes or the JSON shape were wrong, never that a room
//! or a connection misbehaved.

/// Errors that can occur while encoding, decoding, or validating messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    ///
    /// Common causes: malformed JSON, a `PLAYER_STATE` frame with the
    /// wrong number of elements, or an unknown `type` tag.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message parsed but breaks a protocol rule.
    ///
    /// For example, a relay target that is neither a session id, `"*"`,
    /// nor a list of session ids.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
