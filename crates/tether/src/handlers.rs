//! Local execution routines, one per operation code
//!
//! Every routine runs against an object this side exported. Errors are
//! returned as values; the dispatch loop turns them into error responses.

use crate::connection::ConnectionInner;
use crate::object::{is_reserved_name, RemoteObject};
use crate::value::{object_addr, same_object, CallArgs, SliceOp, SliceRange, Value};
use crate::{Result, RpcError};
use std::fmt::Write as _;
use std::sync::Arc;
use tether_proto::{ErrorPayload, Op};

/// Execute `op` on behalf of the peer
pub(crate) async fn handle(conn: &Arc<ConnectionInner>, op: Op, oid: u64, args: CallArgs) -> Result<Value> {
    match op {
        Op::Ping => Ok(args.args.into_iter().next().unwrap_or(Value::None)),
        Op::Close => Ok(Value::None),
        Op::GetRoot => Ok(Value::Object(conn.root().clone())),
        Op::Del => del(conn, oid, &args),
        Op::GetAttr => getattr(&conn.lookup_export(oid)?, &args).await,
        Op::SetAttr => setattr(conn, &conn.lookup_export(oid)?, args).await,
        Op::DelAttr => delattr(conn, &conn.lookup_export(oid)?, &args).await,
        Op::Call => conn.lookup_export(oid)?.call(args).await,
        Op::CallAttr => callattr(&conn.lookup_export(oid)?, args).await,
        Op::Repr => Ok(Value::Str(conn.lookup_export(oid)?.repr())),
        Op::Str => Ok(Value::Str(conn.lookup_export(oid)?.to_str())),
        Op::Hash => hash(&conn.lookup_export(oid)?),
        Op::Cmp => cmp(&conn.lookup_export(oid)?, &args),
        Op::Dir => Ok(Value::Tuple(
            conn.lookup_export(oid)?.dir().into_iter().map(Value::Str).collect(),
        )),
        Op::Pickle => pickle(conn, &conn.lookup_export(oid)?),
        Op::Inspect => Ok(inspect(&conn.lookup_export(oid)?)),
        Op::OldSlicing => oldslicing(&conn.lookup_export(oid)?, args).await,
    }
}

fn attr_name(args: &CallArgs) -> Result<&str> {
    args.get(0)?.as_str()
}

fn del(conn: &ConnectionInner, oid: u64, args: &CallArgs) -> Result<Value> {
    let count = match args.args.first() {
        Some(count) => count.as_int()?,
        None => 1,
    };
    if count > 0 {
        conn.release_export(oid, count as u64);
    }
    Ok(Value::None)
}

async fn getattr(target: &Arc<dyn RemoteObject>, args: &CallArgs) -> Result<Value> {
    target.getattr(attr_name(args)?).await
}

async fn setattr(conn: &ConnectionInner, target: &Arc<dyn RemoteObject>, args: CallArgs) -> Result<Value> {
    if !conn.config().allow_setattr {
        return Err(RpcError::Attribute("attribute writes are disabled on this connection".to_string()));
    }
    let mut args = args.args.into_iter();
    let (name, value) = match (args.next(), args.next()) {
        (Some(name), Some(value)) => (name.into_string()?, value),
        _ => return Err(RpcError::Type("SETATTR takes a name and a value".to_string())),
    };
    if is_reserved_name(&name) {
        return Err(RpcError::Attribute(format!("cannot assign reserved attribute '{}'", name)));
    }
    target.setattr(&name, value).await?;
    Ok(Value::None)
}

async fn delattr(conn: &ConnectionInner, target: &Arc<dyn RemoteObject>, args: &CallArgs) -> Result<Value> {
    if !conn.config().allow_delattr {
        return Err(RpcError::Attribute("attribute deletion is disabled on this connection".to_string()));
    }
    let name = attr_name(args)?;
    if is_reserved_name(name) {
        return Err(RpcError::Attribute(format!("cannot delete reserved attribute '{}'", name)));
    }
    target.delattr(name).await?;
    Ok(Value::None)
}

async fn callattr(target: &Arc<dyn RemoteObject>, args: CallArgs) -> Result<Value> {
    let CallArgs { args, kwargs } = args;
    let mut args = args.into_iter();
    let name = match args.next() {
        Some(name) => name.into_string()?,
        None => return Err(RpcError::Type("CALLATTR needs a method name".to_string())),
    };
    target
        .call_method(
            &name,
            CallArgs {
                args: args.collect(),
                kwargs,
            },
        )
        .await
}

fn hash(target: &Arc<dyn RemoteObject>) -> Result<Value> {
    Ok(Value::Int(target.hash().unwrap_or(object_addr(target) as i64)))
}

fn cmp(target: &Arc<dyn RemoteObject>, args: &CallArgs) -> Result<Value> {
    let other = args.get(0)?;
    if let Value::Object(other) = other {
        if same_object(target, other) {
            return Ok(Value::Int(0));
        }
    }
    Ok(Value::Int(target.compare(other)? as i64))
}

fn pickle(conn: &ConnectionInner, target: &Arc<dyn RemoteObject>) -> Result<Value> {
    if !conn.config().allow_pickle {
        return Err(RpcError::Value("pickling is disabled on this connection".to_string()));
    }
    Ok(Value::Bytes(target.pickle()?))
}

fn inspect(target: &Arc<dyn RemoteObject>) -> Value {
    Value::Tuple(
        target
            .methods()
            .into_iter()
            .map(|m| Value::Tuple(vec![Value::Str(m.name), Value::Str(m.doc)]))
            .collect(),
    )
}

/// Legacy slicing: `(item_name, slice_name, start, stop, rest)`
async fn oldslicing(target: &Arc<dyn RemoteObject>, args: CallArgs) -> Result<Value> {
    let mut args = args.args.into_iter();
    let (item_name, slice_name, start, stop, rest) =
        match (args.next(), args.next(), args.next(), args.next(), args.next()) {
            (Some(item), Some(slice), Some(start), Some(stop), rest) => (item, slice, start, stop, rest),
            _ => return Err(RpcError::Type("malformed slice request".to_string())),
        };

    let op = SliceOp::from_slice_name(slice_name.as_str()?).ok_or_else(|| {
        RpcError::Type(format!("unknown slice operation '{:?}'", slice_name))
    })?;
    if item_name.as_str()? != op.item_name() {
        return Err(RpcError::Type(format!(
            "slice operation {} does not translate to {:?}",
            op.slice_name(),
            item_name
        )));
    }

    let stop = match stop {
        Value::None => None,
        stop => Some(stop.as_int()?),
    };
    let range = SliceRange::new(start.as_int()?, stop);
    let rest = match rest {
        Some(Value::Tuple(items)) => items,
        Some(other) => vec![other],
        None => Vec::new(),
    };
    target.slice(op, range, rest).await
}

/// Error payload for a failed request, with rendered traceback if enabled
pub(crate) fn error_payload(conn: &ConnectionInner, op: Op, oid: u64, err: &RpcError) -> ErrorPayload {
    let payload = ErrorPayload::new(err.type_name(), err.message());
    if !conn.config().include_traceback {
        return payload;
    }
    payload.with_traceback(render_traceback(conn, op, oid, err))
}

fn render_traceback(conn: &ConnectionInner, op: Op, oid: u64, err: &RpcError) -> String {
    let mut text = format!("Traceback (connection {}, {}):\n", conn.id(), conn.config().name);
    let _ = writeln!(text, "  {} on {} (oid {})", op, conn.describe_export(oid), oid);
    let _ = write!(text, "{}: {}", err.type_name(), err.message());

    if let Some(remote) = err.as_remote() {
        if !remote.traceback.is_empty() {
            let _ = write!(text, "\n\nraised while handling a remote error:\n{}", remote.traceback);
        }
    }
    text
}
