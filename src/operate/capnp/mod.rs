//! Cap'n Proto RPC capabilities.
//!
//! [`bridge::RpcBridge`] runs one RPC connection on its own thread and lets blocking callers on
//! other threads drive it.
//!
//! [`debug`] serves a [`Runtime`](crate::runtime::Runtime) on the debug wire and implements
//! [`VirtualMachine`](crate::control::VirtualMachine) on top of it.
//!
//! [`execution`] holds both ends of the execution wire.

use std::future::Future;

use capnp::Error;
use capnp_rpc::{rpc_twoparty_capnp::Side, twoparty};
use futures::{
    channel::oneshot,
    io::{BufReader, BufWriter},
    AsyncRead, AsyncWrite,
};

use crate::control::{ControlError, Location, Value};

pub mod bridge;
pub mod debug;
pub mod execution;

capnp::generated_code!(pub mod debug_capnp);
capnp::generated_code!(pub mod agent_capnp);

/// Wraps a stream into a two-party network.
pub(crate) fn network<R, W>(input: R, output: W, side: Side) -> twoparty::VatNetwork<BufReader<R>>
where
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    twoparty::VatNetwork::new(
        BufReader::new(input),
        BufWriter::new(output),
        side,
        Default::default(),
    )
}

/// Runs a blocking operation on its own thread, so that the RPC thread keeps serving.
pub(crate) fn offload<T, F>(name: &str, f: F) -> impl Future<Output = Result<T, Error>> + 'static
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            let _ = tx.send(f());
        });
    async move {
        spawned.map_err(|e| Error::failed(format!("cannot spawn worker: {e}")))?;
        rx.await
            .map_err(|_| Error::failed("worker ended without a result".to_owned()))
    }
}

/// Encodes a process-control error for the wire.
pub(crate) fn encode_error(error: ControlError) -> Error {
    match error {
        ControlError::Disconnected => Error::disconnected("[disconnected] target gone".to_owned()),
        error => Error::failed(format!("[{}] {}", error.kind(), error.detail())),
    }
}

/// Decodes a process-control error from the wire.
pub(crate) fn decode_error(error: Error) -> ControlError {
    if error.kind == capnp::ErrorKind::Disconnected {
        return ControlError::Disconnected;
    }
    let message = error.extra.as_str();
    message
        .find('[')
        .and_then(|start| {
            let rest = &message[start + 1..];
            let (kind, detail) = rest.split_once(']')?;
            Some(ControlError::from_kind(kind, detail.trim_start()))
        })
        .unwrap_or_else(|| ControlError::Transport(error.to_string()))
}

pub(crate) fn write_value(mut builder: debug_capnp::value::Builder<'_>, value: &Value) {
    match value {
        Value::None => builder.set_none(()),
        Value::Bool(b) => builder.set_boolean(*b),
        Value::Int(i) => builder.set_int(*i),
        Value::Text(s) => builder.set_text(s.as_str()),
        Value::Object(id) => builder.set_object(id.0),
    }
}

pub(crate) fn read_value(reader: debug_capnp::value::Reader<'_>) -> Result<Value, Error> {
    use debug_capnp::value::Which;

    Ok(match reader.which()? {
        Which::None(()) => Value::None,
        Which::Boolean(b) => Value::Bool(b),
        Which::Int(i) => Value::Int(i),
        Which::Text(s) => Value::Text(s?.to_str()?.to_owned()),
        Which::Object(id) => Value::Object(crate::control::ObjectId(id)),
    })
}

pub(crate) fn write_location(mut builder: debug_capnp::location::Builder<'_>, location: &Location) {
    builder.set_class(location.class.0);
    builder.set_method(location.method.0);
    builder.set_line(location.line);
}

pub(crate) fn read_location(reader: debug_capnp::location::Reader<'_>) -> Location {
    Location {
        class: crate::control::ClassId(reader.get_class()),
        method: crate::control::MethodId(reader.get_method()),
        line: reader.get_line(),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_error_codec() {
        let errors = [
            ControlError::IncompatibleThreadState("thread#3 is not paused by an event".to_owned()),
            ControlError::NoSuchField("stopException".to_owned()),
            ControlError::Invocation("boom".to_owned()),
        ];
        for error in errors {
            assert_eq!(decode_error(encode_error(error.clone())), error);
        }
        assert_matches!(
            decode_error(encode_error(ControlError::Disconnected)),
            ControlError::Disconnected
        );
    }

    #[test]
    fn test_remote_prefix_is_tolerated() {
        let error = Error::failed("remote exception: [invalid-type] flag is not a bool".to_owned());
        assert_eq!(
            decode_error(error),
            ControlError::InvalidType("flag is not a bool".to_owned())
        );
        assert_matches!(
            decode_error(Error::failed("garbage".to_owned())),
            ControlError::Transport(_)
        );
    }

    #[test]
    fn test_value_codec() {
        let values = [
            Value::None,
            Value::Bool(true),
            Value::Int(-3),
            Value::Text("hello".to_owned()),
            Value::Object(crate::control::ObjectId(12)),
        ];
        for value in values {
            let mut message = capnp::message::Builder::new_default();
            write_value(message.init_root::<debug_capnp::value::Builder>(), &value);
            let reader = message.get_root_as_reader::<debug_capnp::value::Reader>().unwrap();
            assert_eq!(read_value(reader).unwrap(), value);
        }
    }
}
