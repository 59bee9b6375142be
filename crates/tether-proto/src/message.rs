//! Message types and wire values

use crate::{Op, ProtocolError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Object id addressing the connection itself rather than an exported object
pub const NO_OBJECT: u64 = 0;

/// A value as it travels on the wire.
///
/// The by-value variants form a closed set; everything else crosses by
/// reference as an object id owned by one of the two peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    /// Absence of a value
    None,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 text
    Str(String),
    /// Raw bytes
    Bytes(Bytes),
    /// Fixed sequence of values
    Tuple(Vec<WireValue>),
    /// Object owned by the sender of this message
    Remote {
        /// Sender-assigned object id
        oid: u64,
        /// Type name of the object
        type_name: String,
        /// Defining module of the type
        module: String,
    },
    /// Object owned by the receiver of this message, echoed back by id
    Local(u64),
}

impl WireValue {
    /// Whether this value (recursively) carries no object references
    pub fn is_by_value(&self) -> bool {
        match self {
            WireValue::Remote { .. } | WireValue::Local(_) => false,
            WireValue::Tuple(items) => items.iter().all(WireValue::is_by_value),
            _ => true,
        }
    }
}

/// Error reported by the peer that executed a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Type name of the error on the executing side
    pub type_name: String,
    /// Human-readable error message
    pub message: String,
    /// Rendered traceback text
    pub traceback: String,
}

impl ErrorPayload {
    /// Create a new error payload
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            traceback: String::new(),
        }
    }

    /// Attach traceback text
    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = traceback.into();
        self
    }
}

/// A request for the peer to perform an operation on one of its objects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Request id, unique per connection and direction
    pub seq: u64,
    /// Raw operation code, see [`Op`]
    pub op: u8,
    /// Target object id in the receiver's export table
    pub oid: u64,
    /// Positional arguments
    pub args: Vec<WireValue>,
    /// Keyword arguments in call order
    pub kwargs: Vec<(String, WireValue)>,
}

impl Request {
    /// Create a request
    pub fn new(seq: u64, op: Op, oid: u64, args: Vec<WireValue>, kwargs: Vec<(String, WireValue)>) -> Self {
        Self {
            seq,
            op: op.code(),
            oid,
            args,
            kwargs,
        }
    }

    /// Decode the operation code
    pub fn op(&self) -> Result<Op, ProtocolError> {
        Op::try_from(self.op)
    }
}

/// Outcome carried by a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// The operation returned a value
    Ok(WireValue),
    /// The operation raised an error
    Err(ErrorPayload),
}

/// A response matched to its request solely by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this answers
    pub seq: u64,
    /// Result of the operation
    pub outcome: Outcome,
}

impl Response {
    /// Create a success response
    pub fn ok(seq: u64, value: WireValue) -> Self {
        Self {
            seq,
            outcome: Outcome::Ok(value),
        }
    }

    /// Create an error response
    pub fn error(seq: u64, error: ErrorPayload) -> Self {
        Self {
            seq,
            outcome: Outcome::Err(error),
        }
    }

    /// Whether the response carries an error
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Err(_))
    }
}

/// Top-level message wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Request message
    Request(Request),
    /// Response message
    Response(Response),
}

impl Message {
    /// Create a request message
    pub fn request(req: Request) -> Self {
        Self::Request(req)
    }

    /// Create a response message
    pub fn response(resp: Response) -> Self {
        Self::Response(resp)
    }

    /// Request id the message carries
    pub fn seq(&self) -> u64 {
        match self {
            Self::Request(req) => req.seq,
            Self::Response(resp) => resp.seq,
        }
    }

    /// Serialize to MessagePack
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(rmp_serde::to_vec(self)?))
    }

    /// Deserialize from MessagePack
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
