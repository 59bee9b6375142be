//! Root object exposure
//!
//! A [`Service`] is what a peer reaches first: the object returned by
//! GETROOT. It is a named, immutable set of functions and values; anything
//! mutable it hands out (a [`Namespace`](crate::Namespace), a
//! [`List`](crate::List)) is shared, so every request sees the same object.

use crate::builtins::Function;
use crate::object::{MethodInfo, RemoteObject};
use crate::value::{CallArgs, Value};
use crate::{Result, RpcError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// A named root object exposing functions and values
#[derive(Clone)]
pub struct Service {
    name: String,
    functions: BTreeMap<String, Arc<Function>>,
    values: BTreeMap<String, Value>,
}

impl Service {
    /// Empty service called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: BTreeMap::new(),
            values: BTreeMap::new(),
        }
    }

    /// The root used when a side has nothing to expose
    pub fn void() -> Self {
        Self::new("VoidService")
    }

    /// Service name, reported to the peer as the root's type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an async function
    pub fn with_function<F, Fut>(self, name: &str, body: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.with(Function::new(name, body))
    }

    /// Register a synchronous function
    pub fn with_sync_function<F>(self, name: &str, body: F) -> Self
    where
        F: Fn(CallArgs) -> Result<Value> + Send + Sync + 'static,
    {
        self.with(Function::sync(name, body))
    }

    /// Register a prepared function under its own name
    pub fn with(mut self, function: Function) -> Self {
        self.functions.insert(function.name().to_string(), Arc::new(function));
        self
    }

    /// Expose a value as an attribute
    pub fn with_value(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }
}

#[async_trait]
impl RemoteObject for Service {
    fn type_name(&self) -> &str {
        &self.name
    }

    fn module(&self) -> &str {
        "service"
    }

    fn methods(&self) -> Vec<MethodInfo> {
        self.functions
            .values()
            .map(|f| MethodInfo::new(f.name(), f.doc()))
            .collect()
    }

    fn dir(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().chain(self.values.keys()).cloned().collect();
        names.sort();
        names
    }

    async fn getattr(&self, name: &str) -> Result<Value> {
        if let Some(function) = self.functions.get(name) {
            return Ok(Value::Object(function.clone()));
        }
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::Attribute(format!("service '{}' has no attribute '{}'", self.name, name)))
    }

    async fn call_method(&self, name: &str, args: CallArgs) -> Result<Value> {
        if let Some(function) = self.functions.get(name) {
            return function.invoke(args).await;
        }
        match self.values.get(name) {
            Some(Value::Object(target)) => target.call(args).await,
            Some(Value::Netref(target)) => target.call(args).await,
            Some(other) => Err(RpcError::Type(format!("'{}' object is not callable", other.kind()))),
            None => Err(RpcError::Attribute(format!(
                "service '{}' has no attribute '{}'",
                self.name, name
            ))),
        }
    }

    fn repr(&self) -> String {
        format!("<service {}>", self.name)
    }
}
