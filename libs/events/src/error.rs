//! Error types for signal handling.

use thiserror::Error;

/// Errors that can occur when handling signals.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The signal kind is unknown.
    #[error("unknown signal kind: {0}")]
    UnknownKind(String),

    /// The channel name is not `{kind}:{system_id}`.
    #[error("invalid channel name '{channel}': {reason}")]
    InvalidChannel { channel: String, reason: String },

    /// The signal payload does not match its kind.
    #[error("invalid {kind} payload: {message}")]
    InvalidPayload { kind: String, message: String },

    /// The payload names a different machine than the channel.
    #[error("payload for {payload} delivered on channel for {channel}")]
    MachineMismatch { channel: String, payload: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
