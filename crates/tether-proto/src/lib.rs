//! # Tether Protocol
//!
//! Wire protocol for the Tether remote object system: operation codes,
//! request/response messages, wire values and the length-prefixed frame
//! channel they travel on.

#![warn(missing_docs)]

/// Length-prefixed frame codec
pub mod codec;

/// Ordered, reliable frame channel over async byte streams
pub mod channel;

/// Remote operation codes
pub mod op;

/// Message types and wire values
pub mod message;

/// Error types for protocol operations
pub mod error;

pub use channel::{Channel, ChannelReader, ChannelWriter};
pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use message::{ErrorPayload, Message, Outcome, Request, Response, WireValue, NO_OBJECT};
pub use op::Op;
