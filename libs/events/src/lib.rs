//! # devfarm-events
//!
//! Message definitions and framing for the devfarm message bus.
//!
//! ## Design Principles
//!
//! - Messages are immutable, fire-and-forget records
//! - Every message travels on exactly one topic
//! - Messages are versioned for schema evolution
//!
//! ## Framing
//!
//! A message is sent as two frames: the topic name, then the JSON encoded
//! [`Envelope`]. Subscribers filter on the first frame without decoding the
//! second.
//!
//! ## Message Types
//!
//! - Device status (`device.status`) published by providers on `global`

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
