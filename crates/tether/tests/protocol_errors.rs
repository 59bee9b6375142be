//! A hand-driven peer speaking raw frames

mod common;

use common::{calculator, pair};
use tether::proto::{Channel, Message, Outcome, Request, Response, WireValue, MAX_FRAME_SIZE, NO_OBJECT};
use tether::{CallArgs, Connection, ConnectionBuilder, Namespace, Op, RpcError, Service, Value};
use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

type RawPeer = Channel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

async fn raw_peer(builder: ConnectionBuilder) -> (Connection, RawPeer) {
    let (conn_io, raw_io) = duplex(64 * 1024);
    let conn = builder.with_name("target").connect_stream(conn_io).await.expect("connect");
    (conn, Channel::from_stream(raw_io, MAX_FRAME_SIZE))
}

async fn recv_message(raw: &mut RawPeer) -> anyhow::Result<Message> {
    let frame = raw.recv().await?.ok_or_else(|| anyhow::anyhow!("stream ended"))?;
    Ok(Message::decode(&frame)?)
}

#[tokio::test]
async fn test_raw_peer_can_drive_requests() -> anyhow::Result<()> {
    let (conn, mut raw) = raw_peer(ConnectionBuilder::new().with_root(calculator())).await;

    let ping = Request::new(1, Op::Ping, NO_OBJECT, vec![WireValue::Str("x".into())], vec![]);
    raw.send(&Message::request(ping).encode()?).await?;
    assert!(conn.serve(None).await?);
    match recv_message(&mut raw).await? {
        Message::Response(response) => {
            assert_eq!(response, Response::ok(1, WireValue::Str("x".into())));
        }
        other => panic!("Expected response, got {:?}", other),
    }

    let get_root = Request::new(2, Op::GetRoot, NO_OBJECT, vec![], vec![]);
    raw.send(&Message::request(get_root).encode()?).await?;
    assert!(conn.serve(None).await?);
    match recv_message(&mut raw).await? {
        Message::Response(Response { seq: 2, outcome }) => {
            let expected = WireValue::Remote {
                oid: 1,
                type_name: "Calculator".into(),
                module: "service".into(),
            };
            assert_eq!(outcome, tether::proto::Outcome::Ok(expected));
        }
        other => panic!("Expected response to 2, got {:?}", other),
    }
    assert_eq!(conn.export_refcount(1), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_response_to_unknown_request_is_fatal() -> anyhow::Result<()> {
    let (conn, mut raw) = raw_peer(ConnectionBuilder::new()).await;

    let pending = conn.async_request(Op::Ping, NO_OBJECT, CallArgs::new().arg(1))?;
    let request = match recv_message(&mut raw).await? {
        Message::Request(request) => request,
        other => panic!("Expected request, got {:?}", other),
    };
    assert_eq!(request.op()?, Op::Ping);

    let stray = Response::ok(request.seq + 100, WireValue::Int(1));
    raw.send(&Message::response(stray).encode()?).await?;

    let err = conn.serve(None).await.unwrap_err();
    assert!(matches!(err, RpcError::Protocol(_)));
    assert!(conn.is_closed());
    assert!(matches!(pending.value(), Some(Err(RpcError::Protocol(_)))));
    assert!(matches!(conn.ping().await, Err(RpcError::ConnectionClosed)));

    // the writer side shuts down with the connection
    assert!(raw.recv().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_unknown_operation_is_fatal() -> anyhow::Result<()> {
    let (conn, mut raw) = raw_peer(ConnectionBuilder::new()).await;

    let mut request = Request::new(1, Op::Ping, NO_OBJECT, vec![], vec![]);
    request.op = 99;
    raw.send(&Message::request(request).encode()?).await?;

    let err = conn.serve(None).await.unwrap_err();
    assert!(matches!(err, RpcError::Protocol(ref message) if message.contains("99")));
    assert!(conn.is_closed());
    assert_eq!(conn.stats().requests_served, 0);
    assert!(raw.recv().await?.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_waiter_sees_the_fatal_reason() -> anyhow::Result<()> {
    let (conn, mut raw) = raw_peer(ConnectionBuilder::new()).await;

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let conn = conn.clone();
        waiters.push(tokio::spawn(async move { conn.ping().await.map(|_| ()) }));
    }
    let pending = conn.async_request(Op::Ping, NO_OBJECT, CallArgs::new().arg(1))?;
    let waiting = {
        let pending = pending.clone();
        tokio::spawn(async move { pending.wait(None).await.map(|_| ()) })
    };
    for _ in 0..4 {
        assert!(matches!(recv_message(&mut raw).await?, Message::Request(_)));
    }

    raw.send(&[0xc1, 0x00, 0x01]).await?;

    waiters.push(waiting);
    for waiter in waiters {
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), waiter).await??;
        assert!(matches!(outcome, Err(RpcError::Protocol(_))), "got {:?}", outcome);
    }
    assert!(conn.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_undecodable_frame_is_fatal() -> anyhow::Result<()> {
    let (conn, mut raw) = raw_peer(ConnectionBuilder::new()).await;
    raw.send(&[0xc1, 0x00, 0x01]).await?;

    let err = conn.serve_all().await.unwrap_err();
    assert!(matches!(err, RpcError::Protocol(_)));
    assert!(conn.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_oversized_incoming_frame_is_fatal() -> anyhow::Result<()> {
    let (conn, mut raw) = raw_peer(ConnectionBuilder::new().with_max_frame_size(1024)).await;
    raw.send(&[0u8; 4096]).await?;

    let err = conn.serve(None).await.unwrap_err();
    assert!(matches!(err, RpcError::Protocol(ref message) if message.contains("too large")));
    assert!(conn.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_truncated_frame_is_fatal() -> anyhow::Result<()> {
    let (conn_io, mut raw_io) = duplex(1024);
    let conn = ConnectionBuilder::new().connect_stream(conn_io).await?;

    raw_io.write_all(&[0, 0, 0, 100, 1, 2, 3]).await?;
    raw_io.shutdown().await?;

    assert!(matches!(conn.serve(None).await, Err(RpcError::Protocol(_))));
    assert!(conn.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_oversized_response_becomes_error_reply() -> anyhow::Result<()> {
    let root = Service::new("Big").with_sync_function("blob", |_| {
        Ok(Value::Tuple(vec![Value::object(Namespace::new()), Value::Str("x".repeat(4096))]))
    });
    let (conn, mut raw) = raw_peer(ConnectionBuilder::new().with_root(root).with_max_frame_size(1024)).await;

    // export the root first so CALLATTR has a target
    let get_root = Request::new(1, Op::GetRoot, NO_OBJECT, vec![], vec![]);
    raw.send(&Message::request(get_root).encode()?).await?;
    assert!(conn.serve(None).await?);
    recv_message(&mut raw).await?;

    let call = Request::new(2, Op::CallAttr, 1, vec![WireValue::Str("blob".into())], vec![]);
    raw.send(&Message::request(call).encode()?).await?;
    assert!(conn.serve(None).await?);

    match recv_message(&mut raw).await? {
        Message::Response(Response {
            seq: 2,
            outcome: Outcome::Err(payload),
        }) => {
            assert_eq!(payload.type_name, "ValueError");
            assert!(payload.message.contains("too large"));
        }
        other => panic!("Expected error response to 2, got {:?}", other),
    }
    assert!(!conn.is_closed());
    // only the root stays exported; the namespace in the dropped reply does not
    assert_eq!(conn.stats().exports, 1);
    assert_eq!(conn.export_refcount(1), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_oversized_request_is_not_sent_and_exports_nothing() -> anyhow::Result<()> {
    let (a, b) = pair(
        ConnectionBuilder::new().with_max_frame_size(1024),
        ConnectionBuilder::new().with_root(calculator()),
    )
    .await;
    let _serving = b.serve_in_background();
    let root = a.root().await?;

    let store = Value::object(Namespace::new());
    let args = CallArgs::new().arg(store.clone()).arg("x".repeat(4096));
    let err = root.invoke("echo", args).await.unwrap_err();
    assert!(matches!(err, RpcError::TooLarge { max: 1024, .. }));
    assert!(!err.is_fatal());
    assert!(!a.is_closed());
    assert_eq!(a.stats().exports, 0);
    assert_eq!(a.stats().pending, 0);

    // the same object still exports cleanly afterwards
    let echoed = root.invoke("echo", CallArgs::new().arg(store)).await?;
    assert_eq!(echoed.into_tuple()?.len(), 1);
    a.ping().await?;
    Ok(())
}

#[tokio::test]
async fn test_failed_boxing_gives_back_partial_exports() -> anyhow::Result<()> {
    let (a, b) = pair(ConnectionBuilder::new(), ConnectionBuilder::new().with_root(calculator())).await;
    let (c, d) = pair(ConnectionBuilder::new(), ConnectionBuilder::new().with_root(calculator())).await;
    let _serving_b = b.serve_in_background();
    let _serving_d = d.serve_in_background();
    let root = a.root().await?;
    let foreign = c.root().await?;

    let served = b.stats().requests_served;
    let mixed = Value::Tuple(vec![Value::object(Namespace::new()), Value::Netref(foreign)]);
    let err = root.invoke("echo", CallArgs::new().arg(mixed)).await.unwrap_err();
    assert!(matches!(err, RpcError::Type(_)));
    assert_eq!(a.stats().exports, 0);
    assert_eq!(b.stats().requests_served, served);
    Ok(())
}
