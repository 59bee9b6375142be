//! Built-in exportable types
//!
//! Their method directories are fixed, so their proxy classes are generated
//! once per process and shared by every connection instead of being queried
//! from the peer.

use crate::netref::NetrefClass;
use crate::object::{MethodInfo, RemoteObject};
use crate::value::{cmp_sequences, CallArgs, SliceOp, SliceRange, Value};
use crate::{Result, RpcError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

const FUNCTION_METHODS: &[(&str, &str)] = &[("__call__", "Invoke the function")];

const LIST_METHODS: &[(&str, &str)] = &[
    ("append", "Append an item to the end"),
    ("extend", "Append every item of a tuple"),
    ("pop", "Remove and return the item at an index (default last)"),
    ("__len__", "Number of items"),
    ("__iter__", "Iterator over a snapshot of the items"),
    ("__contains__", "Whether an equal item is present"),
    ("__getitem__", "Item at an index"),
    ("__setitem__", "Replace the item at an index"),
    ("__delitem__", "Remove the item at an index"),
    ("__getslice__", "Items in a range"),
    ("__setslice__", "Replace the items in a range"),
    ("__delslice__", "Remove the items in a range"),
];

const LIST_ITERATOR_METHODS: &[(&str, &str)] = &[
    ("__next__", "Next item, or StopIteration"),
    ("__next_chunk__", "Up to n next items; empty once exhausted"),
];

fn directory(table: &[(&str, &str)]) -> Vec<MethodInfo> {
    table.iter().map(|(name, doc)| MethodInfo::new(*name, *doc)).collect()
}

/// Process-wide proxy classes for the built-in types, keyed by (type, module)
pub fn builtin_classes() -> &'static HashMap<(String, String), Arc<NetrefClass>> {
    static CLASSES: OnceLock<HashMap<(String, String), Arc<NetrefClass>>> = OnceLock::new();
    CLASSES.get_or_init(|| {
        [
            ("function", "builtins", FUNCTION_METHODS),
            ("list", "builtins", LIST_METHODS),
            ("list_iterator", "builtins", LIST_ITERATOR_METHODS),
            ("namespace", "types", &[][..]),
            ("restricted", "builtins", &[][..]),
        ]
        .into_iter()
        .map(|(name, module, table)| {
            let class = NetrefClass::new(name, module, directory(table));
            ((name.to_string(), module.to_string()), Arc::new(class))
        })
        .collect()
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type FunctionBody = Arc<dyn Fn(CallArgs) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A callable exported by reference
#[derive(Clone)]
pub struct Function {
    name: String,
    doc: String,
    body: FunctionBody,
}

impl Function {
    /// Wrap an async closure
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            doc: String::new(),
            body: Arc::new(move |args| body(args).boxed()),
        }
    }

    /// Wrap a synchronous closure
    pub fn sync<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(CallArgs) -> Result<Value> + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        Self::new(name, move |args| {
            let body = body.clone();
            async move { body(args) }
        })
    }

    /// Attach documentation
    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    /// Function name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Function documentation
    pub fn doc(&self) -> &str {
        &self.doc
    }

    /// Run the function locally
    pub async fn invoke(&self, args: CallArgs) -> Result<Value> {
        (self.body)(args).await
    }
}

#[async_trait]
impl RemoteObject for Function {
    fn type_name(&self) -> &str {
        "function"
    }

    fn module(&self) -> &str {
        "builtins"
    }

    fn methods(&self) -> Vec<MethodInfo> {
        directory(FUNCTION_METHODS)
    }

    fn dir(&self) -> Vec<String> {
        vec!["__call__".to_string(), "__name__".to_string()]
    }

    async fn getattr(&self, name: &str) -> Result<Value> {
        match name {
            "__name__" => Ok(Value::Str(self.name.clone())),
            _ => Err(RpcError::Attribute(format!("'function' object has no attribute '{}'", name))),
        }
    }

    async fn call(&self, args: CallArgs) -> Result<Value> {
        self.invoke(args).await
    }

    async fn call_method(&self, name: &str, args: CallArgs) -> Result<Value> {
        match name {
            "__call__" => self.invoke(args).await,
            _ => Err(RpcError::Attribute(format!("'function' object has no attribute '{}'", name))),
        }
    }

    fn repr(&self) -> String {
        format!("<function {}>", self.name)
    }
}

/// A mutable sequence exported by reference
#[derive(Default)]
pub struct List {
    items: Mutex<Vec<Value>>,
}

impl List {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// List holding `items`
    pub fn from_items(items: Vec<Value>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    /// Copy of the current items
    pub fn snapshot(&self) -> Vec<Value> {
        lock(&self.items).clone()
    }

    /// Number of items
    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an item
    pub fn push(&self, value: Value) {
        lock(&self.items).push(value);
    }

    fn index(&self, index: i64, len: usize) -> Result<usize> {
        let resolved = if index < 0 { index + len as i64 } else { index };
        if resolved < 0 || resolved >= len as i64 {
            return Err(RpcError::Index("list index out of range".to_string()));
        }
        Ok(resolved as usize)
    }

    fn get(&self, index: i64) -> Result<Value> {
        let items = lock(&self.items);
        let i = self.index(index, items.len())?;
        Ok(items[i].clone())
    }

    fn set(&self, index: i64, value: Value) -> Result<()> {
        let old = {
            let mut items = lock(&self.items);
            let i = self.index(index, items.len())?;
            std::mem::replace(&mut items[i], value)
        };
        drop(old);
        Ok(())
    }

    fn remove(&self, index: Option<i64>) -> Result<Value> {
        let mut items = lock(&self.items);
        if items.is_empty() {
            return Err(RpcError::Index("pop from empty list".to_string()));
        }
        let len = items.len();
        let i = self.index(index.unwrap_or(-1), len)?;
        Ok(items.remove(i))
    }
}

#[async_trait]
impl RemoteObject for List {
    fn type_name(&self) -> &str {
        "list"
    }

    fn module(&self) -> &str {
        "builtins"
    }

    fn methods(&self) -> Vec<MethodInfo> {
        directory(LIST_METHODS)
    }

    async fn call_method(&self, name: &str, args: CallArgs) -> Result<Value> {
        match name {
            "append" => {
                self.push(args.get(0)?.clone());
                Ok(Value::None)
            }
            "extend" => {
                let extra = args.get(0)?.as_tuple()?.to_vec();
                lock(&self.items).extend(extra);
                Ok(Value::None)
            }
            "pop" => {
                let index = args.args.first().map(Value::as_int).transpose()?;
                self.remove(index)
            }
            "__len__" => Ok(Value::Int(self.len() as i64)),
            "__iter__" => Ok(Value::object(ListIterator::new(self.snapshot()))),
            "__contains__" => {
                let needle = args.get(0)?;
                Ok(Value::Bool(lock(&self.items).iter().any(|item| item == needle)))
            }
            "__getitem__" => self.get(args.get(0)?.as_int()?),
            "__setitem__" => {
                self.set(args.get(0)?.as_int()?, args.get(1)?.clone())?;
                Ok(Value::None)
            }
            "__delitem__" => {
                let removed = self.remove(Some(args.get(0)?.as_int()?))?;
                drop(removed);
                Ok(Value::None)
            }
            other => Err(RpcError::Attribute(format!("'list' object has no attribute '{}'", other))),
        }
    }

    fn repr(&self) -> String {
        format!("{:?}", lock(&self.items))
    }

    fn compare(&self, other: &Value) -> Result<std::cmp::Ordering> {
        match other {
            Value::Tuple(items) => cmp_sequences(&lock(&self.items), items),
            other => Err(RpcError::Type(format!("cannot compare 'list' with '{}'", other.kind()))),
        }
    }

    async fn slice(&self, op: SliceOp, range: SliceRange, rest: Vec<Value>) -> Result<Value> {
        match op {
            SliceOp::Get => {
                let items = lock(&self.items);
                let span = range.resolve(items.len());
                Ok(Value::object(List::from_items(items[span].to_vec())))
            }
            SliceOp::Set => {
                let replacement = match rest.into_iter().next() {
                    Some(Value::Tuple(items)) => items,
                    Some(other) => {
                        return Err(RpcError::Type(format!("can only assign a tuple, not '{}'", other.kind())))
                    }
                    None => return Err(RpcError::Type("missing slice replacement".to_string())),
                };
                let removed: Vec<Value> = {
                    let mut items = lock(&self.items);
                    let span = range.resolve(items.len());
                    items.splice(span, replacement).collect()
                };
                drop(removed);
                Ok(Value::None)
            }
            SliceOp::Delete => {
                let removed: Vec<Value> = {
                    let mut items = lock(&self.items);
                    let span = range.resolve(items.len());
                    items.drain(span).collect()
                };
                drop(removed);
                Ok(Value::None)
            }
        }
    }
}

/// Iterator over a snapshot of a [`List`]
pub struct ListIterator {
    items: Mutex<std::vec::IntoIter<Value>>,
}

impl ListIterator {
    /// Iterate over `items`
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items: Mutex::new(items.into_iter()),
        }
    }
}

#[async_trait]
impl RemoteObject for ListIterator {
    fn type_name(&self) -> &str {
        "list_iterator"
    }

    fn module(&self) -> &str {
        "builtins"
    }

    fn methods(&self) -> Vec<MethodInfo> {
        directory(LIST_ITERATOR_METHODS)
    }

    async fn call_method(&self, name: &str, args: CallArgs) -> Result<Value> {
        match name {
            "__next__" => lock(&self.items).next().ok_or(RpcError::StopIteration),
            "__next_chunk__" => {
                let count = args.get(0)?.as_int()?.max(1) as usize;
                Ok(Value::Tuple(lock(&self.items).by_ref().take(count).collect()))
            }
            other => Err(RpcError::Attribute(format!(
                "'list_iterator' object has no attribute '{}'",
                other
            ))),
        }
    }
}

/// An attribute bag exported by reference
#[derive(Default)]
pub struct Namespace {
    attrs: Mutex<BTreeMap<String, Value>>,
}

impl Namespace {
    /// Empty namespace
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style attribute insertion
    pub fn with(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Set an attribute
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        let old = lock(&self.attrs).insert(name.into(), value.into());
        drop(old);
    }

    /// Read an attribute
    pub fn get(&self, name: &str) -> Option<Value> {
        lock(&self.attrs).get(name).cloned()
    }
}

#[async_trait]
impl RemoteObject for Namespace {
    fn type_name(&self) -> &str {
        "namespace"
    }

    fn module(&self) -> &str {
        "types"
    }

    fn dir(&self) -> Vec<String> {
        lock(&self.attrs).keys().cloned().collect()
    }

    async fn getattr(&self, name: &str) -> Result<Value> {
        self.get(name)
            .ok_or_else(|| RpcError::Attribute(format!("'namespace' object has no attribute '{}'", name)))
    }

    async fn setattr(&self, name: &str, value: Value) -> Result<()> {
        self.set(name, value);
        Ok(())
    }

    async fn delattr(&self, name: &str) -> Result<()> {
        let removed = lock(&self.attrs).remove(name);
        match removed {
            Some(_) => Ok(()),
            None => Err(RpcError::Attribute(name.to_string())),
        }
    }

    fn repr(&self) -> String {
        let names: Vec<String> = self.dir();
        format!("namespace({})", names.join(", "))
    }
}

/// Exposes only an allow-list of another object's attributes.
///
/// Reads and method calls are limited to the readable names, writes and
/// deletions to the writable ones; anything else fails as if the attribute
/// did not exist. The proxy class is fixed and method-less, so the peer
/// learns nothing about the wrapped type beyond what it is allowed to use.
pub struct Restricted {
    inner: Arc<dyn RemoteObject>,
    readable: BTreeSet<String>,
    writable: BTreeSet<String>,
}

impl Restricted {
    /// Wrap `inner`, allowing reads and calls of `readable`
    pub fn new<T: RemoteObject>(inner: T, readable: &[&str]) -> Self {
        Self::shared(Arc::new(inner), readable)
    }

    /// Wrap an already shared object
    pub fn shared(inner: Arc<dyn RemoteObject>, readable: &[&str]) -> Self {
        Self {
            inner,
            readable: readable.iter().map(|name| name.to_string()).collect(),
            writable: BTreeSet::new(),
        }
    }

    /// Also allow writing and deleting `writable`
    pub fn with_writable(mut self, writable: &[&str]) -> Self {
        self.writable.extend(writable.iter().map(|name| name.to_string()));
        self
    }

    fn hidden(name: &str) -> RpcError {
        RpcError::Attribute(format!("'restricted' object has no attribute '{}'", name))
    }
}

#[async_trait]
impl RemoteObject for Restricted {
    fn type_name(&self) -> &str {
        "restricted"
    }

    fn module(&self) -> &str {
        "builtins"
    }

    fn dir(&self) -> Vec<String> {
        self.readable.iter().cloned().collect()
    }

    async fn getattr(&self, name: &str) -> Result<Value> {
        if !self.readable.contains(name) {
            return Err(Self::hidden(name));
        }
        self.inner.getattr(name).await
    }

    async fn setattr(&self, name: &str, value: Value) -> Result<()> {
        if !self.writable.contains(name) {
            return Err(Self::hidden(name));
        }
        self.inner.setattr(name, value).await
    }

    async fn delattr(&self, name: &str) -> Result<()> {
        if !self.writable.contains(name) {
            return Err(Self::hidden(name));
        }
        self.inner.delattr(name).await
    }

    async fn call_method(&self, name: &str, args: CallArgs) -> Result<Value> {
        if !self.readable.contains(name) {
            return Err(Self::hidden(name));
        }
        self.inner.call_method(name, args).await
    }

    fn repr(&self) -> String {
        "<restricted object>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[tokio::test]
    async fn test_function_sync_and_async() {
        let add = Function::sync("add", |args| Ok(Value::Int(args.get(0)?.as_int()? + args.get(1)?.as_int()?)));
        let result = add.call(CallArgs::new().arg(2).arg(3)).await.unwrap();
        assert_eq!(result, Value::Int(5));
        assert_eq!(add.getattr("__name__").await.unwrap(), Value::from("add"));

        let shout = Function::new("shout", |args: CallArgs| async move {
            Ok::<_, RpcError>(Value::Str(args.get(0)?.as_str()?.to_uppercase()))
        })
        .with_doc("upper-case its argument");
        assert_eq!(shout.doc(), "upper-case its argument");
        let result = shout.call_method("__call__", CallArgs::new().arg("hi")).await.unwrap();
        assert_eq!(result, Value::from("HI"));
    }

    #[tokio::test]
    async fn test_list_methods() {
        let list = List::from_items(vec![1.into(), 2.into()]);
        list.call_method("append", CallArgs::new().arg(3)).await.unwrap();
        assert_eq!(list.call_method("__len__", CallArgs::new()).await.unwrap(), Value::Int(3));
        assert_eq!(list.call_method("__getitem__", CallArgs::new().arg(-1)).await.unwrap(), Value::Int(3));
        assert_eq!(list.call_method("pop", CallArgs::new()).await.unwrap(), Value::Int(3));
        assert_eq!(
            list.call_method("__contains__", CallArgs::new().arg(2)).await.unwrap(),
            Value::Bool(true)
        );
        assert!(matches!(
            list.call_method("__getitem__", CallArgs::new().arg(9)).await,
            Err(RpcError::Index(_))
        ));

        let five = List::from_items(vec![5.into()]);
        assert_eq!(five.compare(&Value::Tuple(vec![1.into()])).unwrap(), Ordering::Greater);
        assert_eq!(five.compare(&Value::Tuple(vec![9.into()])).unwrap(), Ordering::Less);
        assert_eq!(five.compare(&Value::Tuple(vec![5.into(), 0.into()])).unwrap(), Ordering::Less);
        assert_eq!(five.compare(&Value::Tuple(vec![5.into()])).unwrap(), Ordering::Equal);
        assert!(matches!(
            five.compare(&Value::Tuple(vec!["5".into()])),
            Err(RpcError::Type(_))
        ));
    }

    #[tokio::test]
    async fn test_list_slicing() {
        let list = List::from_items((0..8).map(Value::from).collect());

        let part = list.slice(SliceOp::Get, SliceRange::new(2, Some(5)), vec![]).await.unwrap();
        let part = part.as_object().unwrap().call_method("__len__", CallArgs::new()).await.unwrap();
        assert_eq!(part, Value::Int(3));

        list.slice(SliceOp::Set, SliceRange::new(0, Some(2)), vec![Value::Tuple(vec!["a".into()])])
            .await
            .unwrap();
        assert_eq!(list.snapshot()[0], Value::from("a"));
        assert_eq!(list.len(), 7);

        list.slice(SliceOp::Delete, SliceRange::new(3, None), vec![]).await.unwrap();
        assert_eq!(list.len(), 3);
    }

    #[tokio::test]
    async fn test_list_iterator_exhausts() {
        let iter = ListIterator::new(vec![1.into()]);
        assert_eq!(iter.call_method("__next__", CallArgs::new()).await.unwrap(), Value::Int(1));
        assert!(matches!(
            iter.call_method("__next__", CallArgs::new()).await,
            Err(RpcError::StopIteration)
        ));
    }

    #[tokio::test]
    async fn test_list_iterator_chunks() {
        let iter = ListIterator::new((0..5).map(Value::from).collect());
        let chunk = iter.call_method("__next_chunk__", CallArgs::new().arg(3)).await.unwrap();
        assert_eq!(chunk, Value::Tuple(vec![0.into(), 1.into(), 2.into()]));
        assert_eq!(iter.call_method("__next__", CallArgs::new()).await.unwrap(), Value::Int(3));
        let chunk = iter.call_method("__next_chunk__", CallArgs::new().arg(3)).await.unwrap();
        assert_eq!(chunk, Value::Tuple(vec![4.into()]));
        let chunk = iter.call_method("__next_chunk__", CallArgs::new().arg(3)).await.unwrap();
        assert_eq!(chunk, Value::Tuple(vec![]));
    }

    #[tokio::test]
    async fn test_restricted_allow_lists() {
        let inner = Arc::new(Namespace::new().with("public", 1).with("secret", 2));
        let guarded = Restricted::shared(inner.clone(), &["public"]).with_writable(&["public"]);

        assert_eq!(guarded.getattr("public").await.unwrap(), Value::Int(1));
        assert!(matches!(guarded.getattr("secret").await, Err(RpcError::Attribute(_))));
        assert!(matches!(guarded.setattr("secret", Value::None).await, Err(RpcError::Attribute(_))));
        assert!(matches!(guarded.delattr("secret").await, Err(RpcError::Attribute(_))));
        assert_eq!(inner.get("secret"), Some(Value::Int(2)));

        guarded.setattr("public", Value::from("changed")).await.unwrap();
        assert_eq!(inner.get("public"), Some(Value::from("changed")));
        assert_eq!(guarded.dir(), vec!["public".to_string()]);
        assert!(guarded.methods().is_empty());
        assert_eq!(guarded.repr(), "<restricted object>");
    }

    #[tokio::test]
    async fn test_restricted_method_calls() {
        let list = List::from_items(vec![1.into()]);
        let guarded = Restricted::new(list, &["__len__"]);
        assert_eq!(guarded.call_method("__len__", CallArgs::new()).await.unwrap(), Value::Int(1));
        assert!(matches!(
            guarded.call_method("pop", CallArgs::new()).await,
            Err(RpcError::Attribute(_))
        ));
    }

    #[tokio::test]
    async fn test_namespace_attributes() {
        let ns = Namespace::new().with("x", 1);
        ns.setattr("y", Value::from("two")).await.unwrap();
        assert_eq!(ns.getattr("y").await.unwrap(), Value::from("two"));
        assert_eq!(ns.dir(), vec!["x".to_string(), "y".to_string()]);
        ns.delattr("x").await.unwrap();
        assert!(matches!(ns.getattr("x").await, Err(RpcError::Attribute(_))));
    }

    #[test]
    fn test_builtin_classes_cover_builtin_types() {
        let classes = builtin_classes();
        let list = &classes[&("list".to_string(), "builtins".to_string())];
        assert!(list.method("append").is_some());
        assert!(list.method("__getslice__").is_some());
        assert!(classes.contains_key(&("namespace".to_string(), "types".to_string())));
        let restricted = &classes[&("restricted".to_string(), "builtins".to_string())];
        assert_eq!(restricted.method_names().count(), 0);
        assert!(classes[&("function".to_string(), "builtins".to_string())].is_callable());
    }
}
