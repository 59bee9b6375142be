//! Unit tests for the connection tables

use super::*;
use crate::builtins::{List, Namespace};
use crate::config::ConnectionBuilder;
use crate::service::Service;
use tokio::io::{duplex, DuplexStream};

async fn lone_connection() -> (Connection, DuplexStream) {
    let (local, remote) = duplex(64 * 1024);
    let conn = ConnectionBuilder::new()
        .with_name("unit")
        .connect_stream(local)
        .await
        .unwrap();
    (conn, remote)
}

#[tokio::test]
async fn test_export_by_identity() {
    let (conn, _remote) = lone_connection().await;
    let object: Arc<dyn RemoteObject> = Arc::new(Namespace::new());
    let value = Value::Object(object.clone());

    let first = conn.inner.box_value(&value).unwrap();
    let second = conn.inner.box_value(&value).unwrap();
    let other = conn.inner.box_value(&Value::object(Namespace::new())).unwrap();

    let oid = match (&first, &second, &other) {
        (WireValue::Remote { oid: a, .. }, WireValue::Remote { oid: b, .. }, WireValue::Remote { oid: c, .. }) => {
            assert_eq!(a, b);
            assert_ne!(a, c);
            *a
        }
        _ => panic!("Expected remote references"),
    };
    assert_ne!(oid, NO_OBJECT);
    assert_eq!(conn.export_refcount(oid), Some(2));
    assert_eq!(conn.stats().exports, 2);
}

#[tokio::test]
async fn test_nested_values_box_recursively() {
    let (conn, _remote) = lone_connection().await;
    let value = Value::Tuple(vec![Value::Int(1), Value::Tuple(vec![Value::object(List::new())])]);

    match conn.inner.box_value(&value).unwrap() {
        WireValue::Tuple(items) => {
            assert_eq!(items[0], WireValue::Int(1));
            match &items[1] {
                WireValue::Tuple(inner) => assert!(matches!(
                    &inner[0],
                    WireValue::Remote { type_name, module, .. } if type_name == "list" && module == "builtins"
                )),
                other => panic!("Expected tuple, got {:?}", other),
            }
        }
        other => panic!("Expected tuple, got {:?}", other),
    }
}

#[tokio::test]
async fn test_release_export_counts_down() {
    let (conn, _remote) = lone_connection().await;
    let value = Value::object(Namespace::new());
    let oid = match conn.inner.box_value(&value).unwrap() {
        WireValue::Remote { oid, .. } => oid,
        _ => panic!("Expected remote reference"),
    };
    conn.inner.box_value(&value).unwrap();
    conn.inner.box_value(&value).unwrap();

    conn.inner.release_export(oid, 2);
    assert_eq!(conn.export_refcount(oid), Some(1));
    conn.inner.release_export(oid, 1);
    assert_eq!(conn.export_refcount(oid), None);

    // a late or duplicate decrement is harmless
    conn.inner.release_export(oid, 1);
    conn.inner.release_export(9999, 1);
    assert_eq!(conn.stats().exports, 0);

    // exporting again after release starts a new entry
    let again = conn.inner.box_value(&value).unwrap();
    assert!(matches!(again, WireValue::Remote { oid: fresh, .. } if fresh != oid));
}

#[tokio::test]
async fn test_unboxing_local_reference() {
    let (conn, _remote) = lone_connection().await;
    let object: Arc<dyn RemoteObject> = Arc::new(Service::new("Exported"));
    let oid = match conn.inner.box_value(&Value::Object(object.clone())).unwrap() {
        WireValue::Remote { oid, .. } => oid,
        _ => panic!("Expected remote reference"),
    };

    let back = conn.inner.unbox(WireValue::Local(oid)).await.unwrap();
    assert_eq!(back, Value::Object(object));
    assert!(matches!(
        conn.inner.unbox(WireValue::Local(oid + 100)).await,
        Err(RpcError::UnknownObject(_))
    ));
}

#[tokio::test]
async fn test_teardown_fails_pending_and_blocks_new_requests() {
    let (conn, _remote) = lone_connection().await;
    let pending = conn.async_request(Op::Ping, NO_OBJECT, CallArgs::new()).unwrap();
    assert_eq!(conn.stats().pending, 1);

    conn.inner.teardown(RpcError::Protocol("test".into()));

    assert!(conn.is_closed());
    assert!(matches!(pending.value(), Some(Err(RpcError::Protocol(_)))));
    assert_eq!(conn.stats().pending, 0);
    assert!(matches!(
        conn.async_request(Op::Ping, NO_OBJECT, CallArgs::new()),
        Err(RpcError::ConnectionClosed)
    ));
    assert!(matches!(conn.serve(None).await, Err(RpcError::ConnectionClosed)));
}

#[tokio::test]
async fn test_decref_after_close_is_silent() {
    let (conn, _remote) = lone_connection().await;
    conn.inner.teardown(RpcError::ConnectionClosed);
    conn.inner.post_decref(5, 3);
    assert_eq!(conn.stats().pending, 0);
}

#[tokio::test]
async fn test_serve_times_out_quietly() {
    let (conn, _remote) = lone_connection().await;
    let served = conn.serve(Some(Duration::from_millis(10))).await.unwrap();
    assert!(!served);
    assert!(!conn.is_closed());
}

#[test]
fn test_parse_directory() {
    let directory = Value::Tuple(vec![
        Value::Tuple(vec!["spin".into(), "Spin it".into()]),
        Value::Tuple(vec!["stop".into(), "".into()]),
    ]);
    let methods = parse_directory(directory).unwrap();
    assert_eq!(methods, vec![MethodInfo::new("spin", "Spin it"), MethodInfo::new("stop", "")]);

    assert!(parse_directory(Value::Tuple(vec![Value::Tuple(vec!["only".into()])])).is_err());
    assert!(parse_directory(Value::Int(3)).is_err());
}
