use anyhow::{bail, Result};

use crate::store::stream::{EntryId, IdSpec, RangeBound, StreamEntry};
use crate::store::{StoreError, Value, ValueOptions};

use super::handler::RespValue;
use super::server::HostContext;

const NOT_AN_INTEGER: &str = "ERR value is not an integer or out of range";

/// Extracts the lowercased command name. Anything that is not an array
/// headed by a bulk string is a protocol error and closes the connection.
pub fn parse_command(request: &RespValue) -> Result<String> {
    let RespValue::Array(elements) = request else {
        bail!("expected the request to be an array");
    };
    let Some(first) = elements.first() else {
        bail!("expected a non-empty request array");
    };
    let Some(name) = first.as_str() else {
        bail!("expected the command name to be a bulk string");
    };

    Ok(name.to_ascii_lowercase())
}

/// Routes one request. While the connection is inside a MULTI, everything
/// except EXEC/DISCARD is queued and answered with QUEUED.
pub async fn dispatch(
    host: &HostContext,
    conn_id: u64,
    name: &str,
    request: &RespValue,
) -> RespValue {
    log::debug!("connection {conn_id}: handling '{name}'");

    if host.in_transaction(conn_id) && name != "exec" && name != "discard" {
        host.queue_command(conn_id, name, request.clone());
        return RespValue::simple("QUEUED");
    }

    execute(host, conn_id, name, request).await
}

fn execute<'a>(
    host: &'a HostContext,
    conn_id: u64,
    name: &'a str,
    request: &'a RespValue,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = RespValue> + Send + 'a>> {
    Box::pin(async move {
        let args = match request {
            RespValue::Array(elements) => elements.as_slice(),
            _ => &[],
        };

        match name {
            "ping" => RespValue::simple("PONG"),
            "echo" => handle_echo(args),
            "get" => handle_get(host, args).await,
            "set" => handle_set(host, args, request).await,
            "incr" => handle_incr(host, args, request).await,
            "keys" => handle_keys(host, args).await,
            "type" => handle_type(host, args).await,
            "config" => handle_config(host, args).await,
            "info" => handle_info(host),
            "multi" => {
                host.begin_transaction(conn_id);
                RespValue::ok()
            }
            "exec" => handle_exec(host, conn_id).await,
            "discard" => handle_discard(host, conn_id),
            "xadd" => handle_xadd(host, args).await,
            "xrange" => handle_xrange(host, args).await,
            "xread" => handle_xread(host, args).await,
            "wait" => RespValue::Integer(0),
            "replconf" => handle_replconf(host, args),
            // PSYNC takes over the socket and is intercepted by the connection
            // loop before dispatch; it cannot run from a transaction replay
            "psync" => RespValue::error("ERR PSYNC is only valid as a top-level command"),
            _ => RespValue::error(format!("ERR unknown command '{name}'")),
        }
    })
}

fn arg_str<'a>(args: &'a [RespValue], index: usize) -> Option<&'a str> {
    args.get(index).and_then(RespValue::as_str)
}

fn arity_error(name: &str) -> RespValue {
    RespValue::error(format!("ERR wrong number of arguments for '{name}' command"))
}

fn handle_echo(args: &[RespValue]) -> RespValue {
    match args {
        [_, value] => value.clone(),
        _ => arity_error("echo"),
    }
}

async fn handle_get(host: &HostContext, args: &[RespValue]) -> RespValue {
    let Some(key) = arg_str(args, 1) else {
        return arity_error("get");
    };

    match host.store.get(key).await {
        None => RespValue::NullBulkString,
        Some(Value::String(s)) => RespValue::bulk(s),
        Some(Value::Integer(n)) => RespValue::Integer(n),
        Some(Value::Stream(_)) => RespValue::error(StoreError::WrongType.to_string()),
    }
}

async fn handle_set(host: &HostContext, args: &[RespValue], request: &RespValue) -> RespValue {
    let (Some(key), Some(value)) = (arg_str(args, 1), arg_str(args, 2)) else {
        return arity_error("set");
    };

    let mut options = ValueOptions::default();
    match args.len() {
        3 => {}
        5 => {
            let (Some(opt), Some(raw_ms)) = (arg_str(args, 3), arg_str(args, 4)) else {
                return RespValue::error("ERR syntax error");
            };
            if !opt.eq_ignore_ascii_case("px") {
                return RespValue::error("ERR syntax error");
            }
            let Ok(ms) = raw_ms.parse() else {
                return RespValue::error(NOT_AN_INTEGER);
            };
            options.expiry = Some(ms);
        }
        _ => return RespValue::error("ERR syntax error"),
    }

    host.store
        .set(key, Value::String(value.to_string()), options)
        .await;
    host.pubsub.publish(request.serialize()).await;

    RespValue::ok()
}

async fn handle_incr(host: &HostContext, args: &[RespValue], request: &RespValue) -> RespValue {
    let Some(key) = arg_str(args, 1) else {
        return arity_error("incr");
    };

    let next = match host.store.get(key).await {
        None => 1,
        Some(Value::Integer(n)) => match n.checked_add(1) {
            Some(next) => next,
            None => return RespValue::error(NOT_AN_INTEGER),
        },
        Some(Value::String(s)) => match s.parse::<i64>().ok().and_then(|n| n.checked_add(1)) {
            Some(next) => next,
            None => return RespValue::error(NOT_AN_INTEGER),
        },
        Some(Value::Stream(_)) => return RespValue::error(StoreError::WrongType.to_string()),
    };

    host.store
        .set(key, Value::Integer(next), ValueOptions::default())
        .await;
    host.pubsub.publish(request.serialize()).await;

    RespValue::Integer(next)
}

async fn handle_keys(host: &HostContext, args: &[RespValue]) -> RespValue {
    let Some(pattern) = arg_str(args, 1) else {
        return arity_error("keys");
    };

    let keys = host.store.list(pattern).await;
    RespValue::Array(keys.into_iter().map(RespValue::bulk).collect())
}

async fn handle_type(host: &HostContext, args: &[RespValue]) -> RespValue {
    let Some(key) = arg_str(args, 1) else {
        return arity_error("type");
    };

    let name = match host.store.get(key).await {
        None => "none",
        Some(Value::String(_)) | Some(Value::Integer(_)) => "string",
        Some(Value::Stream(_)) => "stream",
    };
    RespValue::simple(name)
}

async fn handle_config(host: &HostContext, args: &[RespValue]) -> RespValue {
    let (Some(op), Some(key)) = (arg_str(args, 1), arg_str(args, 2)) else {
        return arity_error("config");
    };

    if !op.eq_ignore_ascii_case("get") {
        return RespValue::error(format!("ERR unknown CONFIG operation '{op}'"));
    }

    match host.config_store.get(key).await {
        Some(Value::String(value)) => {
            RespValue::Array(vec![RespValue::bulk(key), RespValue::bulk(value)])
        }
        // unknown parameters answer with an empty array, not an error
        _ => RespValue::Array(vec![]),
    }
}

fn handle_info(host: &HostContext) -> RespValue {
    let mut info = vec![format!("role:{}", host.role())];

    if let Some(replid) = &host.leader_repl_id {
        info.push(format!("master_replid:{replid}"));
        info.push("master_repl_offset:0".to_string());
    }

    RespValue::bulk(info.join("\r\n") + "\r\n")
}

async fn handle_exec(host: &HostContext, conn_id: u64) -> RespValue {
    if !host.in_transaction(conn_id) {
        return RespValue::error("ERR EXEC without MULTI");
    }

    let queue = host.consume_transaction(conn_id);
    let mut replies = Vec::with_capacity(queue.len());

    for queued in queue {
        // execute already returns a boxed future to break the execute -> exec -> execute cycle
        replies.push(execute(host, conn_id, &queued.name, &queued.request).await);
    }

    RespValue::Array(replies)
}

fn handle_discard(host: &HostContext, conn_id: u64) -> RespValue {
    if !host.in_transaction(conn_id) {
        return RespValue::error("ERR DISCARD without MULTI");
    }

    host.consume_transaction(conn_id);
    RespValue::ok()
}

async fn handle_xadd(host: &HostContext, args: &[RespValue]) -> RespValue {
    if args.len() != 5 {
        return arity_error("xadd");
    }
    let (Some(stream_key), Some(raw_id), Some(field), Some(value)) = (
        arg_str(args, 1),
        arg_str(args, 2),
        arg_str(args, 3),
        arg_str(args, 4),
    ) else {
        return arity_error("xadd");
    };

    let spec: IdSpec = match raw_id.parse() {
        Ok(spec) => spec,
        Err(err) => return RespValue::error(err.to_string()),
    };

    match host
        .store
        .set_stream(stream_key, spec, field, value, ValueOptions::default())
        .await
    {
        Ok(id) => RespValue::bulk(id.to_string()),
        Err(err) => RespValue::error(err.to_string()),
    }
}

fn entry_to_resp(entry: &StreamEntry) -> RespValue {
    let mut fields = Vec::with_capacity(entry.fields.len() * 2);
    for (field, value) in &entry.fields {
        fields.push(RespValue::bulk(field.clone()));
        fields.push(RespValue::bulk(value.clone()));
    }

    RespValue::Array(vec![
        RespValue::bulk(entry.id.to_string()),
        RespValue::Array(fields),
    ])
}

async fn handle_xrange(host: &HostContext, args: &[RespValue]) -> RespValue {
    if args.len() != 4 {
        return arity_error("xrange");
    }
    let (Some(stream_key), Some(raw_start), Some(raw_end)) =
        (arg_str(args, 1), arg_str(args, 2), arg_str(args, 3))
    else {
        return arity_error("xrange");
    };

    let (start, end): (RangeBound, RangeBound) = match (raw_start.parse(), raw_end.parse()) {
        (Ok(start), Ok(end)) => (start, end),
        (Err(err), _) | (_, Err(err)) => return RespValue::error(err.to_string()),
    };

    match host.store.get_stream(stream_key, start, end).await {
        Ok(entries) => RespValue::Array(entries.iter().map(entry_to_resp).collect()),
        Err(err) => RespValue::error(err.to_string()),
    }
}

async fn handle_xread(host: &HostContext, args: &[RespValue]) -> RespValue {
    if args.len() < 4 || (args.len() - 2) % 2 != 0 {
        return arity_error("xread");
    }
    let Some(marker) = arg_str(args, 1) else {
        return arity_error("xread");
    };
    if !marker.eq_ignore_ascii_case("streams") {
        return RespValue::error("ERR syntax error");
    }

    let count = (args.len() - 2) / 2;
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let (Some(key), Some(raw_start)) = (arg_str(args, 2 + i), arg_str(args, 2 + count + i))
        else {
            return arity_error("xread");
        };
        let start: EntryId = match raw_start.parse() {
            Ok(id) => id,
            Err(err) => return RespValue::error(err.to_string()),
        };

        match host.store.xread_stream(key, start).await {
            Ok(entries) => results.push(RespValue::Array(vec![
                RespValue::bulk(key),
                RespValue::Array(entries.iter().map(entry_to_resp).collect()),
            ])),
            Err(err) => return RespValue::error(err.to_string()),
        }
    }

    RespValue::Array(results)
}

fn handle_replconf(host: &HostContext, args: &[RespValue]) -> RespValue {
    let Some(sub) = arg_str(args, 1) else {
        return arity_error("replconf");
    };

    match sub.to_ascii_lowercase().as_str() {
        "listening-port" | "capa" => RespValue::ok(),
        "getack" => ack_response(host.processed_bytes()),
        other => RespValue::error(format!("ERR Unrecognized REPLCONF option '{other}'")),
    }
}

/// The `REPLCONF ACK <offset>` array a follower reports back on GETACK.
pub fn ack_response(offset: u64) -> RespValue {
    RespValue::command(&["REPLCONF", "ACK", &offset.to_string()])
}
