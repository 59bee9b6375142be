//! Functions exposed by the agent service

use bytes::Bytes;
use std::process::Stdio;
use tether::{CallArgs, List, Namespace, RpcError, Service, Value};
use tokio::process::Command;
use tracing::debug;

/// The root service the agent exposes to its controller
pub fn agent_service() -> Service {
    Service::new("Agent")
        .with_sync_function("ping", |_| Ok(Value::from("pong")))
        .with_sync_function("echo", |args: CallArgs| Ok(Value::Tuple(args.args)))
        .with_sync_function("platform", |_| Ok(platform()))
        .with_sync_function("pid", |_| Ok(Value::Int(std::process::id() as i64)))
        .with_sync_function("getenv", |args| {
            let name = args.get(0)?.as_str()?;
            Ok(std::env::var(name).ok().into())
        })
        .with_sync_function("cwd", |_| {
            let cwd = std::env::current_dir().map_err(|e| RpcError::raised("OSError", e.to_string()))?;
            Ok(Value::Str(cwd.to_string_lossy().into_owned()))
        })
        .with_function("run", |args: CallArgs| async move { run(args).await })
        .with_sync_function("new_list", |args: CallArgs| Ok(Value::object(List::from_items(args.args))))
        .with_value("store", Value::object(Namespace::new()))
}

/// `(os, arch, family)` of the agent host
fn platform() -> Value {
    Value::Tuple(vec![
        Value::from(std::env::consts::OS),
        Value::from(std::env::consts::ARCH),
        Value::from(std::env::consts::FAMILY),
    ])
}

/// Run `argv` to completion; returns `(exit_code, stdout, stderr)`
async fn run(args: CallArgs) -> tether::Result<Value> {
    let argv = args
        .args
        .iter()
        .map(|arg| arg.as_str().map(str::to_string))
        .collect::<tether::Result<Vec<_>>>()?;
    let Some((program, rest)) = argv.split_first() else {
        return Err(RpcError::Value("empty command".to_string()));
    };
    debug!("Executing process: {:?}", argv);

    let mut cmd = Command::new(program);
    cmd.args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = args.get_kwarg("cwd") {
        cmd.current_dir(cwd.as_str()?);
    }

    let output = cmd
        .output()
        .await
        .map_err(|e| RpcError::raised("OSError", format!("failed to run {}: {}", program, e)))?;

    Ok(Value::Tuple(vec![
        Value::Int(output.status.code().unwrap_or(-1) as i64),
        Value::Bytes(Bytes::from(output.stdout)),
        Value::Bytes(Bytes::from(output.stderr)),
    ]))
}
