//! Local proxies for remote objects
//!
//! A [`Netref`] stands for one object in the peer's export table. Proxies are
//! shared: the connection keeps at most one live proxy per remote object id,
//! and every time the peer sends that object again the proxy's local
//! reference count grows by one, matching the count the peer keeps for it.
//! When the last handle goes away the whole count is returned to the peer in
//! a single DEL.

use crate::async_result::AsyncResult;
use crate::connection::{Connection, ConnectionInner};
use crate::object::{is_reserved_name, MethodInfo};
use crate::value::{CallArgs, SliceOp, Value};
use crate::{Result, RpcError};
use bytes::Bytes;
use futures::Stream;
use serde::de::DeserializeOwned;
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_proto::Op;

/// How a generated method reaches the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Forward {
    /// Invoke the object itself
    Call,
    /// Resolve and invoke a named attribute
    CallAttr,
    /// Legacy slice access
    Slice(SliceOp),
}

/// A forwarding method of a proxy class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodStub {
    name: String,
    doc: String,
    forward: Forward,
}

impl MethodStub {
    /// Method name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Documentation reported by the exporter
    pub fn doc(&self) -> &str {
        &self.doc
    }
}

/// A proxy class generated from a method directory.
///
/// Shared by every proxy whose remote object has the same type and module.
#[derive(Debug, Clone)]
pub struct NetrefClass {
    name: String,
    module: String,
    methods: BTreeMap<String, MethodStub>,
}

impl NetrefClass {
    /// Generate a class from the directory the exporter reported
    pub fn new(name: impl Into<String>, module: impl Into<String>, directory: Vec<MethodInfo>) -> Self {
        let mut methods = BTreeMap::new();
        for MethodInfo { name, doc } in directory {
            if is_reserved_name(&name) {
                continue;
            }
            let forward = match name.as_str() {
                "__call__" => Forward::Call,
                other => match SliceOp::from_slice_name(other) {
                    Some(op) => Forward::Slice(op),
                    None => Forward::CallAttr,
                },
            };
            if name == "next" {
                methods.insert(
                    "__next__".to_string(),
                    MethodStub {
                        name: "__next__".to_string(),
                        doc: doc.clone(),
                        forward,
                    },
                );
            }
            methods.insert(name.clone(), MethodStub { name, doc, forward });
        }

        Self {
            name: name.into(),
            module: module.into(),
            methods,
        }
    }

    /// Remote type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remote module name
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Generated method by name
    pub fn method(&self, name: &str) -> Option<&MethodStub> {
        self.methods.get(name)
    }

    /// Names of all generated methods, sorted
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Whether calling the proxy itself is supported
    pub fn is_callable(&self) -> bool {
        self.methods.contains_key("__call__")
    }
}

impl fmt::Display for NetrefClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<netref class '{}.{}'>", self.module, self.name)
    }
}

pub(crate) struct NetrefInner {
    conn: Weak<ConnectionInner>,
    oid: u64,
    refcount: AtomicU64,
    class: Arc<NetrefClass>,
}

impl NetrefInner {
    pub(crate) fn retain(&self) {
        self.refcount.fetch_add(1, AtomicOrdering::SeqCst);
    }
}

impl Drop for NetrefInner {
    fn drop(&mut self) {
        let Some(conn) = self.conn.upgrade() else {
            return;
        };
        conn.forget_proxy(self.oid, self as *const NetrefInner);
        conn.post_decref(self.oid, *self.refcount.get_mut());
    }
}

/// Proxy for an object owned by the peer.
///
/// Cloning is cheap and yields another handle to the same proxy.
#[derive(Clone)]
pub struct Netref {
    inner: Arc<NetrefInner>,
}

impl Netref {
    pub(crate) fn new(conn: Weak<ConnectionInner>, oid: u64, class: Arc<NetrefClass>) -> Self {
        Self {
            inner: Arc::new(NetrefInner {
                conn,
                oid,
                refcount: AtomicU64::new(1),
                class,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<NetrefInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<NetrefInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn belongs_to(&self, conn: &ConnectionInner) -> bool {
        std::ptr::eq(self.inner.conn.as_ptr(), conn)
    }

    /// Object id in the peer's export table
    pub fn oid(&self) -> u64 {
        self.inner.oid
    }

    /// How many times the peer has handed this object to us and not yet
    /// been told we let go of it
    pub fn refcount(&self) -> u64 {
        self.inner.refcount.load(AtomicOrdering::SeqCst)
    }

    /// Generated proxy class
    pub fn class(&self) -> &NetrefClass {
        &self.inner.class
    }

    /// Owning connection, or `StaleReference` once it is gone
    pub fn connection(&self) -> Result<Connection> {
        self.live().map(Connection::from_inner)
    }

    /// Whether both proxies stand for the same remote object
    pub fn same_object(&self, other: &Netref) -> bool {
        self.inner.oid == other.inner.oid && self.inner.conn.ptr_eq(&other.inner.conn)
    }

    fn live(&self) -> Result<Arc<ConnectionInner>> {
        match self.inner.conn.upgrade() {
            Some(conn) if !conn.is_closed() => Ok(conn),
            _ => Err(RpcError::StaleReference),
        }
    }

    async fn request(&self, op: Op, args: CallArgs) -> Result<Value> {
        let conn = self.live()?;
        conn.sync_request(op, self.oid(), args).await
    }

    fn request_async(&self, op: Op, args: CallArgs) -> Result<AsyncResult> {
        self.live()?.async_request(op, self.oid(), args)
    }

    fn local_attr(&self, name: &str) -> Option<Value> {
        let value = match name {
            "__oid__" => Value::Int(self.oid() as i64),
            "__refcount__" => Value::Int(self.refcount() as i64),
            "__conn__" => match self.inner.conn.upgrade() {
                Some(conn) => Value::Str(conn.id().to_string()),
                None => Value::None,
            },
            "__class__" => Value::Str(self.class().to_string()),
            "__module__" => Value::Str(self.class().module().to_string()),
            "__methods__" => Value::Tuple(self.class().method_names().map(Value::from).collect()),
            _ => return None,
        };
        Some(value)
    }

    /// Read an attribute.
    ///
    /// Proxy bookkeeping (`__oid__`, `__refcount__`, `__conn__`, `__class__`,
    /// `__module__`, `__methods__`) is answered locally; everything else is a
    /// GETATTR on the peer.
    pub async fn getattr(&self, name: &str) -> Result<Value> {
        if let Some(value) = self.local_attr(name) {
            return Ok(value);
        }
        self.request(Op::GetAttr, CallArgs::new().arg(name)).await
    }

    /// Write an attribute; reserved names are rejected without contacting the peer
    pub async fn setattr(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        if is_reserved_name(name) {
            return Err(RpcError::Attribute(format!("cannot assign reserved attribute '{}'", name)));
        }
        let args = CallArgs::new().arg(name).arg(value);
        self.request(Op::SetAttr, args).await.map(|_| ())
    }

    /// Remove an attribute; reserved names are rejected without contacting the peer
    pub async fn delattr(&self, name: &str) -> Result<()> {
        if is_reserved_name(name) {
            return Err(RpcError::Attribute(format!("cannot delete reserved attribute '{}'", name)));
        }
        self.request(Op::DelAttr, CallArgs::new().arg(name)).await.map(|_| ())
    }

    /// Call the remote object itself
    pub async fn call(&self, args: impl Into<CallArgs>) -> Result<Value> {
        self.request(Op::Call, args.into()).await
    }

    /// Call the remote object itself without waiting for the result
    pub fn call_async(&self, args: impl Into<CallArgs>) -> Result<AsyncResult> {
        self.request_async(Op::Call, args.into())
    }

    /// Bind a method by name.
    ///
    /// Names the class does not know are resolved by the peer at call time.
    pub fn method(&self, name: &str) -> BoundMethod {
        let (forward, doc) = match self.class().method(name) {
            Some(stub) => (stub.forward, stub.doc.clone()),
            None => (Forward::CallAttr, String::new()),
        };
        BoundMethod {
            target: self.clone(),
            name: name.to_string(),
            doc,
            forward,
        }
    }

    /// Call a method by name
    pub async fn invoke(&self, name: &str, args: impl Into<CallArgs>) -> Result<Value> {
        self.method(name).call(args).await
    }

    /// Call a method by name without waiting for the result
    pub fn invoke_async(&self, name: &str, args: impl Into<CallArgs>) -> Result<AsyncResult> {
        self.method(name).call_async(args)
    }

    /// Representation computed by the peer
    pub async fn repr(&self) -> Result<String> {
        self.request(Op::Repr, CallArgs::new()).await?.into_string()
    }

    /// Display text computed by the peer
    pub async fn to_str(&self) -> Result<String> {
        self.request(Op::Str, CallArgs::new()).await?.into_string()
    }

    /// Hash computed by the peer
    pub async fn hash(&self) -> Result<i64> {
        self.request(Op::Hash, CallArgs::new()).await?.as_int()
    }

    /// Three-way comparison performed by the peer
    pub async fn compare(&self, other: impl Into<Value>) -> Result<Ordering> {
        let order = self.request(Op::Cmp, CallArgs::new().arg(other)).await?.as_int()?;
        Ok(order.cmp(&0))
    }

    /// Equality; identical proxies compare equal without a round trip
    pub async fn equals(&self, other: impl Into<Value>) -> Result<bool> {
        let other = other.into();
        if let Value::Netref(r) = &other {
            if self.same_object(r) {
                return Ok(true);
            }
        }
        Ok(self.compare(other).await? == Ordering::Equal)
    }

    /// Visible member names reported by the peer
    pub async fn dir(&self) -> Result<Vec<String>> {
        self.request(Op::Dir, CallArgs::new())
            .await?
            .into_tuple()?
            .into_iter()
            .map(Value::into_string)
            .collect()
    }

    /// Serialized form of the remote object
    pub async fn pickle(&self) -> Result<Bytes> {
        Ok(self.request(Op::Pickle, CallArgs::new()).await?.as_bytes()?.clone())
    }

    /// Rebuild the remote object locally from its serialized form
    pub async fn unpickle<T: DeserializeOwned>(&self) -> Result<T> {
        let blob = self.pickle().await?;
        Ok(rmp_serde::from_slice(&blob)?)
    }

    /// Iterate over the remote object
    pub async fn iter(&self) -> Result<NetrefIter> {
        let iterator = self.invoke("__iter__", ()).await?.into_netref()?;
        Ok(NetrefIter::new(iterator))
    }

    /// Read `self[start:stop]`; `None` means unbounded
    pub async fn get_slice(&self, start: i64, stop: Option<i64>) -> Result<Value> {
        self.request(Op::OldSlicing, slice_args(SliceOp::Get, start, stop, Vec::new()))
            .await
    }

    /// Replace `self[start:stop]` with `items`
    pub async fn set_slice(&self, start: i64, stop: Option<i64>, items: Vec<Value>) -> Result<()> {
        let args = slice_args(SliceOp::Set, start, stop, vec![Value::Tuple(items)]);
        self.request(Op::OldSlicing, args).await.map(|_| ())
    }

    /// Remove `self[start:stop]`
    pub async fn del_slice(&self, start: i64, stop: Option<i64>) -> Result<()> {
        let args = slice_args(SliceOp::Delete, start, stop, Vec::new());
        self.request(Op::OldSlicing, args).await.map(|_| ())
    }

    /// Give up this handle and, if it was the last one, tell the peer
    /// right away and wait for the acknowledgement.
    ///
    /// Dropping the last handle does the same without waiting.
    pub async fn release(self) -> Result<()> {
        let Some(inner) = Arc::into_inner(self.inner) else {
            return Ok(());
        };
        let oid = inner.oid;
        let count = inner.refcount.swap(0, AtomicOrdering::SeqCst);
        let conn = inner.conn.upgrade();
        drop(inner);

        match conn {
            Some(conn) if !conn.is_closed() && count > 0 => conn
                .sync_request(Op::Del, oid, CallArgs::new().arg(count as i64))
                .await
                .map(|_| ()),
            _ => Ok(()),
        }
    }
}

fn slice_args(op: SliceOp, start: i64, stop: Option<i64>, rest: Vec<Value>) -> CallArgs {
    CallArgs::new()
        .arg(op.item_name())
        .arg(op.slice_name())
        .arg(start)
        .arg(stop)
        .arg(Value::Tuple(rest))
}

impl PartialEq for Netref {
    fn eq(&self, other: &Self) -> bool {
        self.same_object(other)
    }
}

impl Eq for Netref {}

impl fmt::Debug for Netref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<netref {}.{} oid={}>",
            self.class().module(),
            self.class().name(),
            self.oid()
        )
    }
}

/// A method bound to a proxy
#[derive(Debug, Clone)]
pub struct BoundMethod {
    target: Netref,
    name: String,
    doc: String,
    forward: Forward,
}

impl BoundMethod {
    /// Method name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Documentation reported by the exporter, empty if unknown
    pub fn doc(&self) -> &str {
        &self.doc
    }

    fn request_args(&self, args: CallArgs) -> Result<(Op, CallArgs)> {
        match self.forward {
            Forward::Call => Ok((Op::Call, args)),
            Forward::CallAttr => {
                let mut forwarded = Vec::with_capacity(args.args.len() + 1);
                forwarded.push(Value::Str(self.name.clone()));
                forwarded.extend(args.args);
                Ok((
                    Op::CallAttr,
                    CallArgs {
                        args: forwarded,
                        kwargs: args.kwargs,
                    },
                ))
            }
            Forward::Slice(op) => {
                let start = args.get(0)?.as_int()?;
                let stop = match args.get(1)? {
                    Value::None => None,
                    other => Some(other.as_int()?),
                };
                let rest = args.args.into_iter().skip(2).collect();
                Ok((Op::OldSlicing, slice_args(op, start, stop, rest)))
            }
        }
    }

    /// Call and wait for the result
    pub async fn call(&self, args: impl Into<CallArgs>) -> Result<Value> {
        let (op, args) = self.request_args(args.into())?;
        self.target.request(op, args).await
    }

    /// Call without waiting for the result
    pub fn call_async(&self, args: impl Into<CallArgs>) -> Result<AsyncResult> {
        let (op, args) = self.request_args(args.into())?;
        self.target.request_async(op, args)
    }

    /// Call and wait at most `timeout` for the result
    pub async fn call_timeout(&self, args: impl Into<CallArgs>, timeout: Duration) -> Result<Value> {
        self.call_async(args)?.wait(Some(timeout)).await
    }
}

const NEXT_CHUNK: &str = "__next_chunk__";

/// Iterator over a remote object.
///
/// Fetches one item per round trip unless switched to
/// [`buffered`](NetrefIter::buffered) mode.
#[derive(Debug)]
pub struct NetrefIter {
    iterator: Netref,
    buffer: VecDeque<Value>,
    chunking: Option<Chunking>,
    exhausted: bool,
}

#[derive(Debug, Clone, Copy)]
struct Chunking {
    next: usize,
    max: usize,
}

impl NetrefIter {
    /// Iterate through a proxy for a remote iterator
    pub fn new(iterator: Netref) -> Self {
        Self {
            iterator,
            buffer: VecDeque::new(),
            chunking: None,
            exhausted: false,
        }
    }

    /// Fetch items in chunks: `chunk` items first, doubling on every round
    /// trip up to `max_chunk`.
    ///
    /// Needs `__next_chunk__` on the remote iterator; without it items keep
    /// coming one at a time.
    pub fn buffered(mut self, chunk: usize, max_chunk: usize) -> Self {
        if self.iterator.class().method(NEXT_CHUNK).is_some() {
            let next = chunk.max(1);
            self.chunking = Some(Chunking {
                next,
                max: max_chunk.max(next),
            });
        }
        self
    }

    /// Whether items are fetched in chunks
    pub fn is_buffered(&self) -> bool {
        self.chunking.is_some()
    }

    /// Next item, or `None` once the peer raises StopIteration
    pub async fn next(&mut self) -> Result<Option<Value>> {
        if let Some(item) = self.buffer.pop_front() {
            return Ok(Some(item));
        }
        if self.exhausted {
            return Ok(None);
        }

        let Some(chunking) = &mut self.chunking else {
            return match self.iterator.invoke("__next__", ()).await {
                Ok(value) => Ok(Some(value)),
                Err(err) if err.is_stop_iteration() => {
                    self.exhausted = true;
                    Ok(None)
                }
                Err(err) => Err(err),
            };
        };

        let count = chunking.next;
        chunking.next = (count * 2).min(chunking.max);
        let items = self
            .iterator
            .invoke(NEXT_CHUNK, CallArgs::new().arg(count as i64))
            .await?
            .into_tuple()?;
        self.buffer.extend(items);
        match self.buffer.pop_front() {
            Some(item) => Ok(Some(item)),
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Drain the remaining items
    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    /// Adapt into a stream that ends after the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut iter = state?;
            match iter.next().await {
                Ok(Some(item)) => Some((Ok(item), Some(iter))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(names: &[&str]) -> Vec<MethodInfo> {
        names.iter().map(|n| MethodInfo::new(*n, format!("doc of {}", n))).collect()
    }

    #[test]
    fn test_class_skips_reserved_names() {
        let class = NetrefClass::new("Widget", "app", directory(&["spin", "__repr__", "__oid__", "__class__"]));
        assert!(class.method("spin").is_some());
        assert!(class.method("__repr__").is_none());
        assert!(class.method("__oid__").is_none());
        assert_eq!(class.method_names().collect::<Vec<_>>(), vec!["spin"]);
    }

    #[test]
    fn test_class_forward_kinds() {
        let class = NetrefClass::new(
            "Seq",
            "app",
            directory(&["__call__", "__getslice__", "__delslice__", "next", "size"]),
        );
        assert_eq!(class.method("__call__").unwrap().forward, Forward::Call);
        assert!(class.is_callable());
        assert_eq!(class.method("__getslice__").unwrap().forward, Forward::Slice(SliceOp::Get));
        assert_eq!(class.method("__delslice__").unwrap().forward, Forward::Slice(SliceOp::Delete));
        assert_eq!(class.method("size").unwrap().forward, Forward::CallAttr);
        assert_eq!(class.method("__next__").unwrap().doc(), "doc of next");
        assert_eq!(class.to_string(), "<netref class 'app.Seq'>");
    }

    #[tokio::test]
    async fn test_detached_proxy_is_stale() {
        let class = Arc::new(NetrefClass::new("Widget", "app", directory(&["spin"])));
        let proxy = Netref::new(Weak::new(), 7, class);

        assert_eq!(proxy.getattr("__oid__").await.unwrap(), Value::Int(7));
        assert_eq!(proxy.getattr("__refcount__").await.unwrap(), Value::Int(1));
        assert_eq!(
            proxy.getattr("__methods__").await.unwrap(),
            Value::Tuple(vec![Value::from("spin")])
        );
        assert!(matches!(proxy.invoke("spin", ()).await, Err(RpcError::StaleReference)));
        assert!(matches!(proxy.getattr("speed").await, Err(RpcError::StaleReference)));
        assert!(matches!(proxy.connection(), Err(RpcError::StaleReference)));
        assert_eq!(format!("{:?}", proxy), "<netref app.Widget oid=7>");
    }

    #[tokio::test]
    async fn test_reserved_writes_rejected_locally() {
        let class = Arc::new(NetrefClass::new("Widget", "app", Vec::new()));
        let proxy = Netref::new(Weak::new(), 3, class);
        assert!(matches!(proxy.setattr("__oid__", 4).await, Err(RpcError::Attribute(_))));
        assert!(matches!(proxy.delattr("__class__").await, Err(RpcError::Attribute(_))));
        assert!(matches!(proxy.setattr("speed", 4).await, Err(RpcError::StaleReference)));
    }

    #[test]
    fn test_slice_method_arguments() {
        let class = Arc::new(NetrefClass::new("Seq", "app", directory(&["__getslice__"])));
        let proxy = Netref::new(Weak::new(), 1, class);
        let (op, args) = proxy
            .method("__getslice__")
            .request_args(CallArgs::new().arg(2).arg(Value::None))
            .unwrap();
        assert_eq!(op, Op::OldSlicing);
        assert_eq!(
            args.args,
            vec![
                Value::from("__getitem__"),
                Value::from("__getslice__"),
                Value::Int(2),
                Value::None,
                Value::Tuple(vec![]),
            ]
        );
    }

    #[test]
    fn test_buffering_needs_chunk_support() {
        let plain = Arc::new(NetrefClass::new("gen", "app", directory(&["__next__"])));
        let iter = NetrefIter::new(Netref::new(Weak::new(), 1, plain)).buffered(4, 16);
        assert!(!iter.is_buffered());

        let chunked = Arc::new(NetrefClass::new("gen", "app", directory(&["__next__", "__next_chunk__"])));
        let iter = NetrefIter::new(Netref::new(Weak::new(), 2, chunked)).buffered(0, 0);
        assert!(iter.is_buffered());
        assert_eq!(iter.chunking.map(|c| (c.next, c.max)), Some((1, 1)));
    }

    #[test]
    fn test_unknown_method_goes_through_callattr() {
        let class = Arc::new(NetrefClass::new("Widget", "app", Vec::new()));
        let proxy = Netref::new(Weak::new(), 1, class);
        let (op, args) = proxy.method("spin").request_args(CallArgs::new().arg(1).kwarg("fast", true)).unwrap();
        assert_eq!(op, Op::CallAttr);
        assert_eq!(args.args, vec![Value::from("spin"), Value::Int(1)]);
        assert_eq!(args.kwargs, vec![("fast".to_string(), Value::Bool(true))]);
    }
}
