//! Error types for the Tether library

use std::sync::Arc;
use std::time::Duration;
use tether_proto::{ErrorPayload, ProtocolError};
use thiserror::Error;

/// An error raised on the peer while it executed one of our requests.
///
/// Carries the peer-reported type name, message and traceback text so it can
/// be told apart from errors raised locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote {type_name}: {message}")]
pub struct RemoteException {
    /// Type name of the error on the peer
    pub type_name: String,
    /// Message as reported by the peer
    pub message: String,
    /// Traceback text rendered by the peer
    pub traceback: String,
}

impl RemoteException {
    /// Whether the peer reported the given error type
    pub fn is(&self, type_name: &str) -> bool {
        self.type_name == type_name
    }
}

impl From<ErrorPayload> for RemoteException {
    fn from(payload: ErrorPayload) -> Self {
        Self {
            type_name: payload.type_name,
            message: payload.message,
            traceback: payload.traceback,
        }
    }
}

/// Main error type for Tether operations
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The proxy's connection was torn down; raised before any I/O
    #[error("Stale reference: the owning connection no longer exists")]
    StaleReference,

    /// The peer raised while executing the request
    #[error(transparent)]
    Remote(#[from] RemoteException),

    /// Malformed frame, unknown operation code or unmatched response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An async result was not ready before its deadline
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// The connection is closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Missing or inaccessible attribute
    #[error("AttributeError: {0}")]
    Attribute(String),

    /// Operation not supported by the object's type
    #[error("TypeError: {0}")]
    Type(String),

    /// Argument with the right type but an unusable value
    #[error("ValueError: {0}")]
    Value(String),

    /// Index out of range
    #[error("IndexError: {0}")]
    Index(String),

    /// Iterator exhausted
    #[error("StopIteration")]
    StopIteration,

    /// Object id not present in the export table
    #[error("Unknown object id: {0}")]
    UnknownObject(u64),

    /// An outgoing message exceeds the frame size limit; nothing was sent
    #[error("Message too large: {size} bytes (max: {max})")]
    TooLarge {
        /// Encoded message size
        size: usize,
        /// Configured frame size limit
        max: usize,
    },

    /// Application-defined error
    #[error("{type_name}: {message}")]
    Raised {
        /// Application error type
        type_name: String,
        /// Error message
        message: String,
    },
}

impl RpcError {
    /// Application-defined error with its own type name
    pub fn raised(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Raised {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Type name reported to the peer when this error answers a request
    pub fn type_name(&self) -> &str {
        match self {
            Self::StaleReference => "ReferenceError",
            Self::Remote(e) => &e.type_name,
            Self::Protocol(_) => "ProtocolError",
            Self::Timeout { .. } => "TimeoutError",
            Self::ConnectionClosed => "EOFError",
            Self::Io(_) => "IOError",
            Self::Serialization(_) => "SerializationError",
            Self::Attribute(_) => "AttributeError",
            Self::Type(_) => "TypeError",
            Self::Value(_) => "ValueError",
            Self::Index(_) => "IndexError",
            Self::StopIteration => "StopIteration",
            Self::UnknownObject(_) => "KeyError",
            Self::TooLarge { .. } => "ValueError",
            Self::Raised { type_name, .. } => type_name,
        }
    }

    /// Message without the type-name prefix
    pub fn message(&self) -> String {
        match self {
            Self::Remote(e) => e.message.clone(),
            Self::Attribute(m) | Self::Type(m) | Self::Value(m) | Self::Index(m) => m.clone(),
            Self::Raised { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the error was raised on the peer
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// The remote exception, if any
    pub fn as_remote(&self) -> Option<&RemoteException> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the error leaves the connection unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::ConnectionClosed | Self::Io(_))
    }

    /// Whether this is (local or remote) iterator exhaustion
    pub fn is_stop_iteration(&self) -> bool {
        match self {
            Self::StopIteration => true,
            Self::Remote(e) => e.is("StopIteration"),
            _ => false,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<ProtocolError> for RpcError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => Self::Io(Arc::new(e)),
            ProtocolError::Serialization(msg) => Self::Protocol(format!("undecodable message: {}", msg)),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<rmp_serde::encode::Error> for RpcError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(format!("MessagePack encode error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for RpcError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(format!("MessagePack decode error: {}", err))
    }
}
