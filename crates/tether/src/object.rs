//! The exported object model
//!
//! Anything a peer can hold a reference to implements [`RemoteObject`]. Every
//! operation has a default that raises the error the peer would expect from
//! an object that does not support it, so implementors override only what
//! they actually provide.

use crate::value::{CallArgs, SliceOp, SliceRange, Value};
use crate::{Result, RpcError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::cmp::Ordering;

/// Names reserved by the protocol.
///
/// They refer to proxy-local bookkeeping or to operations with a dedicated
/// operation code; they are never generated as proxy methods and never
/// writable through SETATTR.
pub const RESERVED_NAMES: &[&str] = &[
    "__oid__",
    "__refcount__",
    "__conn__",
    "__methods__",
    "__class__",
    "__module__",
    "__doc__",
    "__dict__",
    "__repr__",
    "__str__",
    "__hash__",
    "__cmp__",
    "__dir__",
    "__reduce__",
    "__del__",
    "__getattr__",
    "__setattr__",
    "__delattr__",
];

/// Whether `name` is reserved by the protocol
pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// One entry of a method directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    /// Method name
    pub name: String,
    /// Short documentation
    pub doc: String,
}

impl MethodInfo {
    /// Create a directory entry
    pub fn new(name: impl Into<String>, doc: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            doc: doc.into(),
        }
    }
}

/// An object that can be exported to the peer
#[async_trait]
pub trait RemoteObject: Send + Sync + 'static {
    /// Type name; with [`RemoteObject::module`] it keys the peer's proxy class cache
    fn type_name(&self) -> &str;

    /// Defining module of the type
    fn module(&self) -> &str {
        "local"
    }

    /// Method directory used by the peer to generate its proxy class
    fn methods(&self) -> Vec<MethodInfo> {
        Vec::new()
    }

    /// Visible member names
    fn dir(&self) -> Vec<String> {
        self.methods().into_iter().map(|m| m.name).collect()
    }

    /// Read a named attribute
    async fn getattr(&self, name: &str) -> Result<Value> {
        Err(RpcError::Attribute(format!(
            "'{}' object has no attribute '{}'",
            self.type_name(),
            name
        )))
    }

    /// Write a named attribute
    async fn setattr(&self, name: &str, _value: Value) -> Result<()> {
        Err(RpcError::Attribute(format!(
            "'{}' object attribute '{}' is read-only",
            self.type_name(),
            name
        )))
    }

    /// Remove a named attribute
    async fn delattr(&self, name: &str) -> Result<()> {
        Err(RpcError::Attribute(format!(
            "'{}' object attribute '{}' cannot be deleted",
            self.type_name(),
            name
        )))
    }

    /// Invoke the object itself
    async fn call(&self, _args: CallArgs) -> Result<Value> {
        Err(RpcError::Type(format!("'{}' object is not callable", self.type_name())))
    }

    /// Resolve a named attribute and invoke it
    async fn call_method(&self, name: &str, args: CallArgs) -> Result<Value> {
        match self.getattr(name).await? {
            Value::Object(target) => target.call(args).await,
            Value::Netref(target) => target.call(args).await,
            other => Err(RpcError::Type(format!("'{}' object is not callable", other.kind()))),
        }
    }

    /// Debug representation
    fn repr(&self) -> String {
        format!("<{}.{} object>", self.module(), self.type_name())
    }

    /// Display representation
    fn to_str(&self) -> String {
        self.repr()
    }

    /// Hash value; `None` hashes by identity
    fn hash(&self) -> Option<i64> {
        None
    }

    /// Three-way comparison with a peer-supplied operand.
    ///
    /// Identity is checked before this is consulted.
    fn compare(&self, other: &Value) -> Result<Ordering> {
        Err(RpcError::Type(format!(
            "'{}' and '{}' are not comparable",
            self.type_name(),
            other.kind()
        )))
    }

    /// Serialize to an opaque blob the peer can rebuild a value from
    fn pickle(&self) -> Result<Bytes> {
        Err(RpcError::Type(format!("cannot pickle '{}' object", self.type_name())))
    }

    /// Legacy slice access with normalized bounds; `rest` carries any extra
    /// arguments, such as the replacement items of a slice assignment
    async fn slice(&self, _op: SliceOp, _range: SliceRange, _rest: Vec<Value>) -> Result<Value> {
        Err(RpcError::Type(format!("'{}' object is not subscriptable", self.type_name())))
    }
}

/// MessagePack-encode a value for [`RemoteObject::pickle`]
pub fn pickle_value<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
}
