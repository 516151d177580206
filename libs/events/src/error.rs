//! Error types for message framing.

use thiserror::Error;

/// Errors that can occur when encoding or decoding messages.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The event type is unknown.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The event version is not supported.
    #[error("unsupported event version: {event_type} v{version}")]
    UnsupportedVersion { event_type: String, version: i32 },

    /// The topic frame is not valid UTF-8 or is empty.
    #[error("invalid topic frame")]
    InvalidTopic,

    /// The message does not have the expected number of frames.
    #[error("expected {expected} frames, got {actual}")]
    FrameCount { expected: usize, actual: usize },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
