//! Values crossing the connection
//!
//! Numbers, text, booleans, bytes, `None` and tuples of those cross by value.
//! Every other value is an object and crosses by reference: a local
//! [`RemoteObject`] is exported and the peer receives a proxy, and a
//! [`Netref`] travels back to its owner as the owner's own object.

use crate::netref::Netref;
use crate::object::RemoteObject;
use crate::{Result, RpcError};
use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A value as seen by local code
#[derive(Clone)]
pub enum Value {
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
    Tuple(Vec<Value>),
    /// Locally owned object, exported by reference
    Object(Arc<dyn RemoteObject>),
    /// Proxy for an object owned by the peer
    Netref(Netref),
}

impl Value {
    /// Wrap a local object
    pub fn object<T: RemoteObject>(object: T) -> Self {
        Value::Object(Arc::new(object))
    }

    /// Whether the value (recursively) crosses by value
    pub fn is_by_value(&self) -> bool {
        match self {
            Value::Object(_) | Value::Netref(_) => false,
            Value::Tuple(items) => items.iter().all(Value::is_by_value),
            _ => true,
        }
    }

    /// Whether this is `None`
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Short name of the value's kind, used in error messages
    pub fn kind(&self) -> &str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::Object(obj) => obj.type_name(),
            Value::Netref(r) => r.class().name(),
        }
    }

    fn mismatch(&self, expected: &str) -> RpcError {
        RpcError::Type(format!("expected {}, got {}", expected, self.kind()))
    }

    /// Integer content
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(*b as i64),
            other => Err(other.mismatch("int")),
        }
    }

    /// Float content, widening integers
    pub fn as_float(&self) -> Result<f64> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            other => Err(other.mismatch("float")),
        }
    }

    /// Boolean content
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.mismatch("bool")),
        }
    }

    /// Text content
    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(other.mismatch("str")),
        }
    }

    /// Byte content
    pub fn as_bytes(&self) -> Result<&Bytes> {
        match self {
            Value::Bytes(b) => Ok(b),
            other => Err(other.mismatch("bytes")),
        }
    }

    /// Tuple items
    pub fn as_tuple(&self) -> Result<&[Value]> {
        match self {
            Value::Tuple(items) => Ok(items),
            other => Err(other.mismatch("tuple")),
        }
    }

    /// Local object
    pub fn as_object(&self) -> Result<&Arc<dyn RemoteObject>> {
        match self {
            Value::Object(obj) => Ok(obj),
            other => Err(other.mismatch("local object")),
        }
    }

    /// Proxy
    pub fn as_netref(&self) -> Result<&Netref> {
        match self {
            Value::Netref(r) => Ok(r),
            other => Err(other.mismatch("netref")),
        }
    }

    /// Take the proxy out of the value
    pub fn into_netref(self) -> Result<Netref> {
        match self {
            Value::Netref(r) => Ok(r),
            other => Err(other.mismatch("netref")),
        }
    }

    /// Take the tuple items out of the value
    pub fn into_tuple(self) -> Result<Vec<Value>> {
        match self {
            Value::Tuple(items) => Ok(items),
            other => Err(other.mismatch("tuple")),
        }
    }

    /// Take the text out of the value
    pub fn into_string(self) -> Result<String> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(other.mismatch("str")),
        }
    }

    /// Three-way comparison of by-value content.
    ///
    /// Numbers (booleans included) compare numerically with each other,
    /// text and bytes lexicographically, tuples item by item. References
    /// are only equal to themselves. Anything else is a TypeError.
    pub fn try_cmp(&self, other: &Value) -> Result<Ordering> {
        let order = match (self, other) {
            (Value::None, Value::None) => Some(Ordering::Equal),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Tuple(a), Value::Tuple(b)) => return cmp_sequences(a, b),
            (Value::Object(_), _) | (Value::Netref(_), _) if self == other => Some(Ordering::Equal),
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(Number::Int(a)), Some(Number::Int(b))) => Some(a.cmp(&b)),
                (Some(a), Some(b)) => a.as_f64().partial_cmp(&b.as_f64()),
                _ => None,
            },
        };
        order.ok_or_else(|| {
            RpcError::Type(format!(
                "'<' not supported between '{}' and '{}'",
                self.kind(),
                other.kind()
            ))
        })
    }

    fn as_number(&self) -> Option<Number> {
        match self {
            Value::Bool(b) => Some(Number::Int(*b as i64)),
            Value::Int(i) => Some(Number::Int(*i)),
            Value::Float(x) => Some(Number::Float(*x)),
            _ => None,
        }
    }
}

#[derive(Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(x) => x,
        }
    }
}

/// Lexicographic comparison: the first unequal pair decides, then length
pub(crate) fn cmp_sequences(a: &[Value], b: &[Value]) -> Result<Ordering> {
    for (x, y) in a.iter().zip(b) {
        match x.try_cmp(y)? {
            Ordering::Equal => continue,
            decided => return Ok(decided),
        }
    }
    Ok(a.len().cmp(&b.len()))
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "{:?}", b),
            Value::Tuple(items) => f.debug_list().entries(items).finish(),
            Value::Object(obj) => write!(f, "<local {}.{}>", obj.module(), obj.type_name()),
            Value::Netref(r) => write!(f, "{:?}", r),
        }
    }
}

/// Equality of by-value content and identity of references
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => same_object(a, b),
            (Value::Netref(a), Value::Netref(b)) => a.same_object(b),
            _ => false,
        }
    }
}

/// Identity comparison of two local objects
pub(crate) fn same_object(a: &Arc<dyn RemoteObject>, b: &Arc<dyn RemoteObject>) -> bool {
    object_addr(a) == object_addr(b)
}

/// Stable identity of a local object while it is alive
pub(crate) fn object_addr(obj: &Arc<dyn RemoteObject>) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::None
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Tuple(items)
    }
}

impl From<Netref> for Value {
    fn from(r: Netref) -> Self {
        Value::Netref(r)
    }
}

impl From<Arc<dyn RemoteObject>> for Value {
    fn from(obj: Arc<dyn RemoteObject>) -> Self {
        Value::Object(obj)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::None)
    }
}

/// Arguments of a call: positional values and keyword pairs in call order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    /// Positional arguments
    pub args: Vec<Value>,
    /// Keyword arguments, order preserved
    pub kwargs: Vec<(String, Value)>,
}

impl CallArgs {
    /// No arguments
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Append a keyword argument
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.push((name.into(), value.into()));
        self
    }

    /// Positional argument at `index`, or a TypeError naming it
    pub fn get(&self, index: usize) -> Result<&Value> {
        self.args.get(index).ok_or_else(|| {
            RpcError::Type(format!(
                "missing positional argument {} (got {})",
                index,
                self.args.len()
            ))
        })
    }

    /// Keyword argument by name (first occurrence)
    pub fn get_kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Number of positional arguments
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether there are no arguments at all
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

impl From<Vec<Value>> for CallArgs {
    fn from(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Vec::new(),
        }
    }
}

impl From<()> for CallArgs {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

/// Which legacy slice operation is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOp {
    /// Read a slice
    Get,
    /// Replace a slice
    Set,
    /// Remove a slice
    Delete,
}

impl SliceOp {
    /// Legacy method name as carried on the wire
    pub fn slice_name(self) -> &'static str {
        match self {
            SliceOp::Get => "__getslice__",
            SliceOp::Set => "__setslice__",
            SliceOp::Delete => "__delslice__",
        }
    }

    /// Item handler the legacy name translates to
    pub fn item_name(self) -> &'static str {
        match self {
            SliceOp::Get => "__getitem__",
            SliceOp::Set => "__setitem__",
            SliceOp::Delete => "__delitem__",
        }
    }

    /// Resolve a legacy method name
    pub fn from_slice_name(name: &str) -> Option<Self> {
        match name {
            "__getslice__" => Some(SliceOp::Get),
            "__setslice__" => Some(SliceOp::Set),
            "__delslice__" => Some(SliceOp::Delete),
            _ => None,
        }
    }
}

/// Normalized slice bounds; `stop == None` means unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    /// First index
    pub start: i64,
    /// One past the last index, or unbounded
    pub stop: Option<i64>,
}

impl SliceRange {
    /// Build a range, mapping the `i64::MAX` open-end sentinel to unbounded
    pub fn new(start: i64, stop: Option<i64>) -> Self {
        Self {
            start,
            stop: stop.filter(|&s| s != i64::MAX),
        }
    }

    /// Concrete `start..stop` within a sequence of `len` items.
    ///
    /// Negative bounds count from the end; out-of-range bounds are clamped.
    pub fn resolve(&self, len: usize) -> std::ops::Range<usize> {
        let len = len as i64;
        let clamp = |i: i64| -> usize {
            let i = if i < 0 { i + len } else { i };
            i.clamp(0, len) as usize
        };
        let start = clamp(self.start);
        let stop = self.stop.map(clamp).unwrap_or(len as usize);
        start..stop.max(start)
    }
}
