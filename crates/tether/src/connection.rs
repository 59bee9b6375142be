//! The protocol engine and dispatch loop
//!
//! A connection is symmetric: both ends export objects, import proxies and
//! send requests. There is no dedicated reader task. Whoever needs the next
//! frame reads it: a caller blocked in a synchronous request, an
//! [`AsyncResult`] being waited on, or a serving loop. The reader lock is held
//! for exactly one frame and released before the frame is dispatched, so a
//! handler that calls back into the peer can keep reading on its own.

use crate::async_result::AsyncResult;
use crate::builtins::builtin_classes;
use crate::config::ConnectionConfig;
use crate::handlers;
use crate::netref::{Netref, NetrefClass, NetrefInner};
use crate::object::{MethodInfo, RemoteObject};
use crate::value::{object_addr, CallArgs, Value};
use crate::{Result, RpcError};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tether_proto::channel::{BoxedReader, BoxedWriter};
use tether_proto::{
    ChannelReader, ChannelWriter, Message, Op, Outcome, ProtocolError, Request, Response, WireValue, NO_OBJECT,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Who is waiting for a response
enum Waiter {
    Sync(oneshot::Sender<Result<Value>>),
    Async(AsyncResult),
    Ignore,
}

struct Export {
    object: Arc<dyn RemoteObject>,
    refcount: u64,
}

/// Connection-wide mutable state, all behind one lock
struct State {
    next_seq: u64,
    next_oid: u64,
    pending: HashMap<u64, Waiter>,
    exports: HashMap<u64, Export>,
    exports_by_addr: HashMap<usize, u64>,
    proxies: HashMap<u64, Weak<NetrefInner>>,
    classes: HashMap<(String, String), Arc<NetrefClass>>,
    outbox: Option<mpsc::UnboundedSender<Bytes>>,
}

impl State {
    fn new(outbox: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            next_seq: 1,
            next_oid: NO_OBJECT + 1,
            pending: HashMap::new(),
            exports: HashMap::new(),
            exports_by_addr: HashMap::new(),
            proxies: HashMap::new(),
            classes: HashMap::new(),
            outbox: Some(outbox),
        }
    }

    fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn alloc_oid(&mut self) -> u64 {
        let oid = self.next_oid;
        self.next_oid += 1;
        oid
    }
}

pub(crate) struct ConnectionInner {
    id: Uuid,
    config: ConnectionConfig,
    root: Arc<dyn RemoteObject>,
    reader: AsyncMutex<ChannelReader<BoxedReader>>,
    state: Mutex<State>,
    closed: AtomicBool,
    shutdown: Notify,
    requests_sent: AtomicU64,
    requests_served: AtomicU64,
}

impl ConnectionInner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(crate) fn root(&self) -> &Arc<dyn RemoteObject> {
        &self.root
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue an encoded message for the writer task
    fn post(&self, message: &Message) -> Result<()> {
        let payload = message.encode()?;
        if payload.len() > self.config.max_frame_size {
            return Err(RpcError::TooLarge {
                size: payload.len(),
                max: self.config.max_frame_size,
            });
        }
        let state = self.state();
        match &state.outbox {
            Some(outbox) => outbox.send(payload).map_err(|_| RpcError::ConnectionClosed),
            None => Err(RpcError::ConnectionClosed),
        }
    }

    /// Register `waiter` and send the request; returns its id
    fn send_request(&self, op: Op, oid: u64, args: &CallArgs, waiter: Waiter) -> Result<u64> {
        let mut wire_args = self.box_all(args.args.iter().chain(args.kwargs.iter().map(|(_, v)| v)))?;
        let wire_kwargs: Vec<(String, WireValue)> = args
            .kwargs
            .iter()
            .map(|(k, _)| k.clone())
            .zip(wire_args.split_off(args.args.len()))
            .collect();

        let registered = {
            let mut state = self.state();
            if state.outbox.is_some() {
                let seq = state.alloc_seq();
                state.pending.insert(seq, waiter);
                Ok(seq)
            } else {
                Err(waiter)
            }
        };
        let seq = match registered {
            Ok(seq) => seq,
            Err(_waiter) => {
                self.unexport_args(&wire_args, &wire_kwargs);
                return Err(RpcError::ConnectionClosed);
            }
        };

        let message = Message::request(Request::new(seq, op, oid, wire_args, wire_kwargs));
        if let Err(err) = self.post(&message) {
            let waiter = self.state().pending.remove(&seq);
            drop(waiter);
            if let Message::Request(request) = &message {
                self.unexport_args(&request.args, &request.kwargs);
            }
            return Err(err);
        }
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        debug!(conn = %self.id, seq, %op, oid, "sent request");
        Ok(seq)
    }

    /// Send a request and pump the connection until its response arrives
    pub(crate) async fn sync_request(self: &Arc<Self>, op: Op, oid: u64, args: CallArgs) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.send_request(op, oid, &args, Waiter::Sync(tx))?;
        drop(args);
        self.wait_reply(rx).await
    }

    /// Send a request whose response resolves an [`AsyncResult`]
    pub(crate) fn async_request(self: &Arc<Self>, op: Op, oid: u64, args: CallArgs) -> Result<AsyncResult> {
        let result = AsyncResult::new(Arc::downgrade(self));
        self.send_request(op, oid, &args, Waiter::Async(result.clone()))?;
        Ok(result)
    }

    async fn wait_reply(self: &Arc<Self>, mut rx: oneshot::Receiver<Result<Value>>) -> Result<Value> {
        loop {
            tokio::select! {
                biased;
                reply = &mut rx => return reply.unwrap_or(Err(RpcError::ConnectionClosed)),
                frame = self.read_frame() => {
                    let handled = match frame {
                        Ok(frame) => self.dispatch_frame(frame).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = handled {
                        return rx.try_recv().unwrap_or(Err(err));
                    }
                }
            }
        }
    }

    /// Read the next frame, holding the reader lock only while reading it
    pub(crate) async fn read_frame(&self) -> Result<Bytes> {
        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }

        let received = tokio::select! {
            _ = &mut shutdown => return Err(RpcError::ConnectionClosed),
            received = async {
                let mut reader = self.reader.lock().await;
                reader.recv().await
            } => received,
        };

        match received {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => {
                info!(conn = %self.id, "peer closed the stream");
                self.teardown(RpcError::ConnectionClosed);
                Err(RpcError::ConnectionClosed)
            }
            Err(err) => Err(self.fail(err.into())),
        }
    }

    /// Handle one frame read from the peer.
    ///
    /// Only errors that end the connection are returned.
    pub(crate) fn dispatch_frame(self: &Arc<Self>, frame: Bytes) -> BoxFuture<'_, Result<()>> {
        async move {
            let message = match Message::decode(&frame) {
                Ok(message) => message,
                Err(err) => return Err(self.fail(err.into())),
            };
            match message {
                Message::Request(request) => self.dispatch_request(request).await,
                Message::Response(response) => self.dispatch_response(response).await,
            }
        }
        .boxed()
    }

    async fn dispatch_request(self: &Arc<Self>, request: Request) -> Result<()> {
        let op = match request.op() {
            Ok(op) => op,
            Err(err) => return Err(self.fail(err.into())),
        };
        let Request {
            seq, oid, args, kwargs, ..
        } = request;
        debug!(conn = %self.id, seq, %op, oid, "serving request");
        self.requests_served.fetch_add(1, Ordering::Relaxed);

        let outcome = match self.unbox_args(args, kwargs).await {
            Ok(args) => handlers::handle(self, op, oid, args).await,
            Err(err) => Err(err),
        };
        let response = match outcome.and_then(|value| self.box_value(&value)) {
            Ok(value) => Response::ok(seq, value),
            Err(err) => {
                debug!(conn = %self.id, seq, %op, oid, "request raised {}", err);
                Response::error(seq, handlers::error_payload(self, op, oid, &err))
            }
        };

        let message = Message::response(response);
        if let Err(err) = self.post(&message) {
            warn!(conn = %self.id, seq, "failed to send response: {}", err);
            if let Message::Response(Response {
                outcome: Outcome::Ok(value),
                ..
            }) = &message
            {
                self.unexport(std::slice::from_ref(value));
            }
            if matches!(err, RpcError::TooLarge { .. }) {
                let payload = handlers::error_payload(self, op, oid, &err);
                if let Err(err) = self.post(&Message::response(Response::error(seq, payload))) {
                    warn!(conn = %self.id, seq, "failed to send error response: {}", err);
                }
            }
        }

        if op == Op::Close {
            info!(conn = %self.id, "peer requested close");
            self.teardown(RpcError::ConnectionClosed);
        }
        Ok(())
    }

    async fn dispatch_response(self: &Arc<Self>, response: Response) -> Result<()> {
        let Response { seq, outcome } = response;
        let waiter = self.state().pending.remove(&seq);
        let Some(waiter) = waiter else {
            return Err(self.fail(ProtocolError::UnknownRequest(seq).into()));
        };

        let result = match outcome {
            Outcome::Ok(value) => self.unbox(value).await,
            Outcome::Err(payload) => Err(RpcError::Remote(payload.into())),
        };
        debug!(conn = %self.id, seq, ok = result.is_ok(), "received response");

        match waiter {
            Waiter::Sync(tx) => {
                let _ = tx.send(result);
            }
            Waiter::Async(pending) => pending.resolve(result),
            Waiter::Ignore => {}
        }
        Ok(())
    }

    /// Log and tear down after a fatal error, handing the error back
    fn fail(&self, err: RpcError) -> RpcError {
        error!(conn = %self.id, name = %self.config.name, "fatal connection error: {}", err);
        self.teardown(err.clone());
        err
    }

    /// Close the connection for good: fail every waiter, release every
    /// export and let the writer task finish
    ///
    /// Every pending waiter holds `reason` before the connection reports
    /// itself closed, so nobody sees a bare `ConnectionClosed` instead.
    pub(crate) fn teardown(&self, reason: RpcError) {
        let (pending, exports, outbox) = {
            let mut state = self.state();
            let Some(outbox) = state.outbox.take() else {
                return;
            };
            state.exports_by_addr.clear();
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.exports),
                outbox,
            )
        };
        info!(
            conn = %self.id,
            name = %self.config.name,
            pending = pending.len(),
            exports = exports.len(),
            "connection closed: {}",
            reason
        );

        for (_, waiter) in pending {
            match waiter {
                Waiter::Sync(tx) => {
                    let _ = tx.send(Err(reason.clone()));
                }
                Waiter::Async(result) => result.resolve(Err(reason.clone())),
                Waiter::Ignore => {}
            }
        }
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        drop(exports);
        drop(outbox);
    }

    /// Convert a local value for the wire, exporting objects it references
    pub(crate) fn box_value(&self, value: &Value) -> Result<WireValue> {
        Ok(match value {
            Value::None => WireValue::None,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(i) => WireValue::Int(*i),
            Value::Float(x) => WireValue::Float(*x),
            Value::Str(s) => WireValue::Str(s.clone()),
            Value::Bytes(b) => WireValue::Bytes(b.clone()),
            Value::Tuple(items) => WireValue::Tuple(self.box_all(items)?),
            Value::Object(object) => self.export(object),
            Value::Netref(proxy) => {
                if !proxy.belongs_to(self) {
                    return Err(RpcError::Type(format!(
                        "{:?} belongs to another connection",
                        proxy
                    )));
                }
                WireValue::Local(proxy.oid())
            }
        })
    }

    /// Box every value or none: on failure the exports already taken are
    /// given back
    fn box_all<'v>(&self, values: impl IntoIterator<Item = &'v Value>) -> Result<Vec<WireValue>> {
        let mut boxed = Vec::new();
        for value in values {
            match self.box_value(value) {
                Ok(wire) => boxed.push(wire),
                Err(err) => {
                    self.unexport(&boxed);
                    return Err(err);
                }
            }
        }
        Ok(boxed)
    }

    /// Undo the export counts taken by boxing values the peer never received
    fn unexport(&self, values: &[WireValue]) {
        for value in values {
            match value {
                WireValue::Remote { oid, .. } => self.release_export(*oid, 1),
                WireValue::Tuple(items) => self.unexport(items),
                _ => {}
            }
        }
    }

    fn unexport_args(&self, args: &[WireValue], kwargs: &[(String, WireValue)]) {
        self.unexport(args);
        for (_, value) in kwargs {
            self.unexport(std::slice::from_ref(value));
        }
    }

    /// Export by identity: the same object always gets the same id
    fn export(&self, object: &Arc<dyn RemoteObject>) -> WireValue {
        let addr = object_addr(object);
        let oid = {
            let mut state = self.state();
            match state.exports_by_addr.get(&addr).copied() {
                Some(oid) => {
                    if let Some(export) = state.exports.get_mut(&oid) {
                        export.refcount += 1;
                    }
                    oid
                }
                None => {
                    let oid = state.alloc_oid();
                    state.exports.insert(
                        oid,
                        Export {
                            object: object.clone(),
                            refcount: 1,
                        },
                    );
                    state.exports_by_addr.insert(addr, oid);
                    oid
                }
            }
        };
        WireValue::Remote {
            oid,
            type_name: object.type_name().to_string(),
            module: object.module().to_string(),
        }
    }

    /// Convert a wire value, wrapping references to peer objects in proxies
    pub(crate) fn unbox(self: &Arc<Self>, wire: WireValue) -> BoxFuture<'_, Result<Value>> {
        async move {
            let value = match wire {
                WireValue::None => Value::None,
                WireValue::Bool(b) => Value::Bool(b),
                WireValue::Int(i) => Value::Int(i),
                WireValue::Float(x) => Value::Float(x),
                WireValue::Str(s) => Value::Str(s),
                WireValue::Bytes(b) => Value::Bytes(b),
                WireValue::Tuple(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.unbox(item).await?);
                    }
                    Value::Tuple(values)
                }
                WireValue::Local(oid) => Value::Object(self.lookup_export(oid)?),
                WireValue::Remote { oid, type_name, module } => {
                    Value::Netref(self.import(oid, type_name, module).await?)
                }
            };
            Ok(value)
        }
        .boxed()
    }

    async fn unbox_args(self: &Arc<Self>, args: Vec<WireValue>, kwargs: Vec<(String, WireValue)>) -> Result<CallArgs> {
        let mut unboxed = CallArgs::new();
        for arg in args {
            unboxed.args.push(self.unbox(arg).await?);
        }
        for (name, value) in kwargs {
            unboxed.kwargs.push((name, self.unbox(value).await?));
        }
        Ok(unboxed)
    }

    /// Proxy for a peer object; reuses the live proxy if there is one
    async fn import(self: &Arc<Self>, oid: u64, type_name: String, module: String) -> Result<Netref> {
        if let Some(proxy) = self.revive_proxy(oid) {
            return Ok(proxy);
        }
        let class = match self.cached_class(&type_name, &module) {
            Some(class) => class,
            None => self.inspect(oid, &type_name, &module).await,
        };
        if let Some(proxy) = self.revive_proxy(oid) {
            return Ok(proxy);
        }

        let proxy = Netref::new(Arc::downgrade(self), oid, class);
        let previous = self.state().proxies.insert(oid, proxy.downgrade());
        drop(previous);
        Ok(proxy)
    }

    fn revive_proxy(&self, oid: u64) -> Option<Netref> {
        let inner = {
            let state = self.state();
            state.proxies.get(&oid).and_then(Weak::upgrade)
        }?;
        inner.retain();
        Some(Netref::from_inner(inner))
    }

    fn cached_class(&self, type_name: &str, module: &str) -> Option<Arc<NetrefClass>> {
        let key = (type_name.to_string(), module.to_string());
        if let Some(class) = builtin_classes().get(&key) {
            return Some(class.clone());
        }
        self.state().classes.get(&key).cloned()
    }

    /// Ask the peer for the method directory of `oid` and cache the class.
    ///
    /// A failed query still yields a usable class without generated methods,
    /// so the reference the peer already counted gets a proxy to return it.
    async fn inspect(self: &Arc<Self>, oid: u64, type_name: &str, module: &str) -> Arc<NetrefClass> {
        let directory = self
            .sync_request(Op::Inspect, oid, CallArgs::new())
            .await
            .and_then(parse_directory);
        match directory {
            Ok(methods) => {
                let class = Arc::new(NetrefClass::new(type_name, module, methods));
                let key = (type_name.to_string(), module.to_string());
                self.state().classes.entry(key).or_insert(class).clone()
            }
            Err(err) => {
                warn!(conn = %self.id, oid, "method directory of {}.{} unavailable: {}", module, type_name, err);
                Arc::new(NetrefClass::new(type_name, module, Vec::new()))
            }
        }
    }

    pub(crate) fn lookup_export(&self, oid: u64) -> Result<Arc<dyn RemoteObject>> {
        self.state()
            .exports
            .get(&oid)
            .map(|export| export.object.clone())
            .ok_or(RpcError::UnknownObject(oid))
    }

    /// `module.type` of an exported object, for tracebacks
    pub(crate) fn describe_export(&self, oid: u64) -> String {
        if oid == NO_OBJECT {
            return "<connection>".to_string();
        }
        match self.lookup_export(oid) {
            Ok(object) => format!("{}.{}", object.module(), object.type_name()),
            Err(_) => "<released>".to_string(),
        }
    }

    /// Drop `count` references to an export; unknown ids are ignored
    pub(crate) fn release_export(&self, oid: u64, count: u64) {
        let released = {
            let mut state = self.state();
            let remaining = match state.exports.get_mut(&oid) {
                Some(export) => {
                    export.refcount = export.refcount.saturating_sub(count);
                    export.refcount
                }
                None => return,
            };
            if remaining > 0 {
                None
            } else {
                let export = state.exports.remove(&oid);
                if let Some(export) = &export {
                    state.exports_by_addr.remove(&object_addr(&export.object));
                }
                export
            }
        };
        if let Some(export) = released {
            debug!(conn = %self.id, oid, "released {}", export.object.type_name());
        }
    }

    /// Remove the cache entry for a dying proxy unless a newer one replaced it
    pub(crate) fn forget_proxy(&self, oid: u64, proxy: *const NetrefInner) {
        let removed = {
            let mut state = self.state();
            match state.proxies.get(&oid) {
                Some(cached) if std::ptr::eq(cached.as_ptr(), proxy) => state.proxies.remove(&oid),
                _ => None,
            }
        };
        drop(removed);
    }

    /// Fire-and-forget DEL from a proxy finalizer; failures are swallowed
    pub(crate) fn post_decref(&self, oid: u64, count: u64) {
        if count == 0 || self.is_closed() {
            return;
        }
        let seq = {
            let mut state = self.state();
            if state.outbox.is_none() {
                return;
            }
            let seq = state.alloc_seq();
            state.pending.insert(seq, Waiter::Ignore);
            seq
        };
        let request = Request::new(seq, Op::Del, oid, vec![WireValue::Int(count as i64)], Vec::new());
        if let Err(err) = self.post(&Message::request(request)) {
            debug!(conn = %self.id, oid, "dropping decref: {}", err);
            let waiter = self.state().pending.remove(&seq);
            drop(waiter);
        }
    }
}

fn parse_directory(value: Value) -> Result<Vec<MethodInfo>> {
    value
        .into_tuple()?
        .into_iter()
        .map(|entry| {
            let mut fields = entry.into_tuple()?.into_iter();
            match (fields.next(), fields.next()) {
                (Some(name), Some(doc)) => Ok(MethodInfo::new(name.into_string()?, doc.into_string()?)),
                _ => Err(RpcError::Type("malformed method directory entry".to_string())),
            }
        })
        .collect()
}

/// Drain the outbox onto the wire until the connection closes
async fn write_loop(
    mut writer: ChannelWriter<BoxedWriter>,
    mut outbox: mpsc::UnboundedReceiver<Bytes>,
    conn: Weak<ConnectionInner>,
    id: Uuid,
) {
    while let Some(payload) = outbox.recv().await {
        if let Err(err) = writer.send(&payload).await {
            error!(conn = %id, "failed to write frame: {}", err);
            if let Some(conn) = conn.upgrade() {
                conn.teardown(err.into());
            }
            break;
        }
    }
    if let Err(err) = writer.shutdown().await {
        debug!(conn = %id, "writer shutdown: {}", err);
    }
    debug!(conn = %id, "writer finished");
}

/// Snapshot of a connection's tables and counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Objects currently exported to the peer
    pub exports: usize,
    /// Requests awaiting a response
    pub pending: usize,
    /// Live proxies for peer objects
    pub proxies: usize,
    /// Requests sent since the connection opened
    pub requests_sent: u64,
    /// Peer requests served since the connection opened
    pub requests_served: u64,
    /// Whether the connection is closed
    pub closed: bool,
}

/// One end of a remote object connection.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Start a connection over a reader/writer pair, exposing `root` to the peer.
    ///
    /// Spawns the writer task, so it must be called within a tokio runtime.
    pub async fn connect<R, W>(
        config: ConnectionConfig,
        root: Arc<dyn RemoteObject>,
        reader: R,
        writer: W,
    ) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let id = Uuid::new_v4();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);

        let inner = Arc::new(ConnectionInner {
            id,
            reader: AsyncMutex::new(ChannelReader::new(reader, config.max_frame_size)),
            state: Mutex::new(State::new(outbox_tx)),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            requests_sent: AtomicU64::new(0),
            requests_served: AtomicU64::new(0),
            root,
            config,
        });

        let writer = ChannelWriter::new(writer, inner.config.max_frame_size);
        tokio::spawn(write_loop(writer, outbox_rx, Arc::downgrade(&inner), id));

        info!(
            conn = %id,
            name = %inner.config.name,
            root = %inner.root.type_name(),
            "connection established"
        );
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    /// Connection identifier used in logs and tracebacks
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Settings the connection was built with
    pub fn config(&self) -> &ConnectionConfig {
        self.inner.config()
    }

    /// Whether the connection has been torn down
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Proxy for the peer's root object
    pub async fn root(&self) -> Result<Netref> {
        self.sync_request(Op::GetRoot, NO_OBJECT, CallArgs::new())
            .await?
            .into_netref()
    }

    /// Send a request and wait for its response.
    ///
    /// Peer requests arriving meanwhile, including calls back into this
    /// side, are served while waiting.
    pub async fn sync_request(&self, op: Op, oid: u64, args: CallArgs) -> Result<Value> {
        self.inner.sync_request(op, oid, args).await
    }

    /// Send a request without waiting for its response
    pub fn async_request(&self, op: Op, oid: u64, args: CallArgs) -> Result<AsyncResult> {
        self.inner.async_request(op, oid, args)
    }

    /// Serve one incoming frame, waiting at most `timeout` for it.
    ///
    /// Returns `false` if nothing arrived in time.
    pub async fn serve(&self, timeout: Option<Duration>) -> Result<bool> {
        let frame = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.inner.read_frame()).await {
                Ok(frame) => frame?,
                Err(_) => return Ok(false),
            },
            None => self.inner.read_frame().await?,
        };
        self.inner.dispatch_frame(frame).await?;
        Ok(true)
    }

    /// Serve until the connection closes; a clean close is not an error
    pub async fn serve_all(&self) -> Result<()> {
        loop {
            match self.serve(None).await {
                Ok(_) => {}
                Err(RpcError::ConnectionClosed) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Serve on a spawned task until stopped or closed.
    ///
    /// Dropping the returned handle stops the task too.
    #[must_use = "dropping the handle stops the serving task"]
    pub fn serve_in_background(&self) -> BgServingTask {
        let conn = self.clone();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            debug!(conn = %conn.id(), "background serving started");
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        debug!(conn = %conn.id(), "background serving stopped");
                        return Ok(());
                    }
                    frame = conn.inner.read_frame() => match frame {
                        Ok(frame) => conn.inner.dispatch_frame(frame).await?,
                        Err(RpcError::ConnectionClosed) => return Ok(()),
                        Err(err) => return Err(err),
                    },
                }
            }
        });

        BgServingTask {
            stop: Some(stop_tx),
            handle,
        }
    }

    /// Round-trip check; returns the measured latency
    pub async fn ping(&self) -> Result<Duration> {
        let payload = Bytes::copy_from_slice(Uuid::new_v4().as_bytes());
        let started = Instant::now();
        let echoed = self
            .sync_request(Op::Ping, NO_OBJECT, CallArgs::new().arg(payload.clone()))
            .await?;
        if echoed.as_bytes()? != &payload {
            return Err(RpcError::Protocol("ping payload mismatch".to_string()));
        }
        Ok(started.elapsed())
    }

    /// Tell the peer we are leaving, then tear the connection down
    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        info!(conn = %self.id(), "closing connection");
        let outcome = self.sync_request(Op::Close, NO_OBJECT, CallArgs::new()).await;
        self.inner.teardown(RpcError::ConnectionClosed);
        match outcome {
            Ok(_) | Err(RpcError::ConnectionClosed) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Current table sizes and counters
    pub fn stats(&self) -> ConnectionStats {
        let state = self.inner.state();
        ConnectionStats {
            exports: state.exports.len(),
            pending: state.pending.len(),
            proxies: state.proxies.values().filter(|p| p.strong_count() > 0).count(),
            requests_sent: self.inner.requests_sent.load(Ordering::Relaxed),
            requests_served: self.inner.requests_served.load(Ordering::Relaxed),
            closed: self.inner.is_closed(),
        }
    }

    /// Outstanding reference count the peer holds on one of our exports
    pub fn export_refcount(&self, oid: u64) -> Option<u64> {
        self.inner.state().exports.get(&oid).map(|export| export.refcount)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle to a task serving a connection in the background
#[derive(Debug)]
pub struct BgServingTask {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<()>>,
}

impl BgServingTask {
    /// Whether the task has ended
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop after the frame being served, if any, and wait for the task
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match (&mut self.handle).await {
            Ok(result) => result,
            Err(err) => Err(RpcError::Protocol(format!("serving task failed: {}", err))),
        }
    }

    /// Wait for the task to end on its own
    pub async fn join(mut self) -> Result<()> {
        let stop = self.stop.take();
        let outcome = match (&mut self.handle).await {
            Ok(result) => result,
            Err(err) => Err(RpcError::Protocol(format!("serving task failed: {}", err))),
        };
        drop(stop);
        outcome
    }
}

#[cfg(test)]
mod tests;
