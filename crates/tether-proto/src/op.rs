//! Remote operation codes
//!
//! Codes are stable integers shared by both peers; they travel on the wire as
//! a plain `u8` so an unknown code can be detected instead of failing
//! deserialization of the whole message.

use crate::ProtocolError;
use std::fmt;

/// Operation requested of the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    /// Liveness check, echoes its argument
    Ping = 1,
    /// Orderly connection shutdown
    Close = 2,
    /// Fetch the peer's root object
    GetRoot = 3,
    /// Read a named attribute
    GetAttr = 4,
    /// Remove a named attribute
    DelAttr = 5,
    /// Write a named attribute
    SetAttr = 6,
    /// Invoke the object itself
    Call = 7,
    /// Resolve a named attribute and invoke it
    CallAttr = 8,
    /// Debug representation
    Repr = 9,
    /// Display representation
    Str = 10,
    /// Three-way comparison
    Cmp = 11,
    /// Hash value
    Hash = 12,
    /// Visible member names
    Dir = 13,
    /// Serialize the object to an opaque blob
    Pickle = 14,
    /// Decrement an export reference count
    Del = 15,
    /// Method directory (name, doc) used to build proxy classes
    Inspect = 16,
    /// Legacy slice get/set/delete
    OldSlicing = 18,
}

impl Op {
    /// All operation codes known to this peer
    pub const ALL: [Op; 17] = [
        Op::Ping,
        Op::Close,
        Op::GetRoot,
        Op::GetAttr,
        Op::DelAttr,
        Op::SetAttr,
        Op::Call,
        Op::CallAttr,
        Op::Repr,
        Op::Str,
        Op::Cmp,
        Op::Hash,
        Op::Dir,
        Op::Pickle,
        Op::Del,
        Op::Inspect,
        Op::OldSlicing,
    ];

    /// Wire code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Upper-case protocol name used in logs and tracebacks
    pub fn name(self) -> &'static str {
        match self {
            Op::Ping => "PING",
            Op::Close => "CLOSE",
            Op::GetRoot => "GETROOT",
            Op::GetAttr => "GETATTR",
            Op::DelAttr => "DELATTR",
            Op::SetAttr => "SETATTR",
            Op::Call => "CALL",
            Op::CallAttr => "CALLATTR",
            Op::Repr => "REPR",
            Op::Str => "STR",
            Op::Cmp => "CMP",
            Op::Hash => "HASH",
            Op::Dir => "DIR",
            Op::Pickle => "PICKLE",
            Op::Del => "DEL",
            Op::Inspect => "INSPECT",
            Op::OldSlicing => "OLDSLICING",
        }
    }
}

impl TryFrom<u8> for Op {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Op::ALL
            .iter()
            .copied()
            .find(|op| op.code() == code)
            .ok_or(ProtocolError::UnknownOp(code))
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
