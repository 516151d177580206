//! Message envelope and two-frame wire framing.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::EventError;
use crate::types::{event_types, topics, DeviceStatusPayload};

/// Current schema version for every event type.
pub const EVENT_VERSION: i32 = 1;

/// The envelope - common metadata for all bus messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P> {
    /// The event type (e.g., "device.status").
    pub event_type: String,

    /// Schema version for this event type.
    pub event_version: i32,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// Event-specific payload.
    pub payload: P,
}

impl<P> Envelope<P> {
    /// Wraps a payload with the current time and schema version.
    pub fn new(event_type: impl Into<String>, payload: P) -> Self {
        Self {
            event_type: event_type.into(),
            event_version: EVENT_VERSION,
            occurred_at: Utc::now(),
            payload,
        }
    }
}

impl<P: Serialize> Envelope<P> {
    /// Encodes the envelope into frames for the given topic.
    pub fn encode(&self, topic: &str) -> Result<Frames, EventError> {
        if topic.is_empty() {
            return Err(EventError::InvalidTopic);
        }
        Ok(Frames {
            topic: topic.to_string(),
            body: serde_json::to_vec(self)?,
        })
    }
}

impl Envelope<DeviceStatusPayload> {
    /// Builds a `device.status` envelope.
    pub fn device_status(payload: DeviceStatusPayload) -> Self {
        Self::new(event_types::DEVICE_STATUS, payload)
    }

    /// Encodes a `device.status` envelope for the global topic.
    pub fn encode_global(&self) -> Result<Frames, EventError> {
        self.encode(topics::GLOBAL)
    }
}

/// A framed message: topic frame followed by the JSON body frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frames {
    pub topic: String,
    pub body: Vec<u8>,
}

impl Frames {
    /// Reassembles frames received from the bus.
    pub fn from_parts(parts: Vec<Vec<u8>>) -> Result<Self, EventError> {
        let actual = parts.len();
        let mut iter = parts.into_iter();
        match (iter.next(), iter.next(), iter.next()) {
            (Some(topic), Some(body), None) => {
                let topic = String::from_utf8(topic).map_err(|_| EventError::InvalidTopic)?;
                if topic.is_empty() {
                    return Err(EventError::InvalidTopic);
                }
                Ok(Self { topic, body })
            }
            _ => Err(EventError::FrameCount {
                expected: 2,
                actual,
            }),
        }
    }

    /// Decodes the body frame, rejecting versions newer than this library.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<Envelope<P>, EventError> {
        let envelope: Envelope<P> = serde_json::from_slice(&self.body)?;
        if envelope.event_version > EVENT_VERSION {
            return Err(EventError::UnsupportedVersion {
                event_type: envelope.event_type,
                version: envelope.event_version,
            });
        }
        Ok(envelope)
    }

    /// Decodes a `device.status` message.
    pub fn decode_device_status(&self) -> Result<Envelope<DeviceStatusPayload>, EventError> {
        let envelope = self.decode::<DeviceStatusPayload>()?;
        if envelope.event_type != event_types::DEVICE_STATUS {
            return Err(EventError::UnknownEventType(envelope.event_type));
        }
        Ok(envelope)
    }

    /// Returns the frames as owned byte vectors, topic first.
    pub fn into_parts(self) -> [Vec<u8>; 2] {
        [self.topic.into_bytes(), self.body]
    }
}
