//! Shared fixtures for cross-peer tests

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;
use tether::{CallArgs, Connection, ConnectionBuilder, List, Namespace, RpcError, Service, Value};
use tokio::io::duplex;

/// Two connected peers; each side's root comes from its builder
pub async fn pair(a: ConnectionBuilder, b: ConnectionBuilder) -> (Connection, Connection) {
    let (a_io, b_io) = duplex(256 * 1024);
    let a = a.with_name("a").connect_stream(a_io).await.expect("connect a");
    let b = b.with_name("b").connect_stream(b_io).await.expect("connect b");
    (a, b)
}

/// Service used as the far side in most tests
pub fn calculator() -> Service {
    Service::new("Calculator")
        .with_sync_function("add", |args| {
            Ok(Value::Int(args.get(0)?.as_int()? + args.get(1)?.as_int()?))
        })
        .with_sync_function("echo", |args: CallArgs| Ok(Value::Tuple(args.args)))
        .with_sync_function("kwarg_names", |args: CallArgs| {
            Ok(Value::Tuple(args.kwargs.into_iter().map(|(k, _)| Value::Str(k)).collect()))
        })
        .with_sync_function("fail", |args| {
            Err(RpcError::Value(args.get(0)?.as_str()?.to_string()))
        })
        .with_function("sleep_then", |args: CallArgs| async move {
            let ms = args.get(0)?.as_int()?;
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            Ok::<_, RpcError>(args.get(1)?.clone())
        })
        .with_function("hang", |_args| async {
            std::future::pending::<()>().await;
            Ok::<_, RpcError>(Value::None)
        })
        .with_sync_function("new_list", |args: CallArgs| Ok(Value::object(List::from_items(args.args))))
        .with_value("store", Value::object(Namespace::new().with("greeting", "hello")))
        .with_value("version", "1.0")
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
