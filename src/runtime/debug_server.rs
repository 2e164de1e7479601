//! Debug port of a runtime.
//!
//! The runtime accepts one controller at a time on its debug port. When a controller goes away,
//! whatever it left behind (traps, suspension, queued events) is disposed of so that the target
//! keeps running undisturbed.

use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    pin::pin,
};

use async_io::Async;
use async_stream::try_stream;
use futures::{executor::LocalPool, FutureExt, Stream, StreamExt};
use log::{debug, info, warn};

use super::Runtime;
use crate::{
    cancellation::CancellationToken, control::VirtualMachine,
    operate::capnp::debug::serve_connection,
};

/// Yields incoming debug connections until cancellation.
pub fn listen(
    listener: Async<TcpListener>,
    cancellation_token: CancellationToken,
) -> impl Stream<Item = std::io::Result<(Async<TcpStream>, SocketAddr)>> {
    try_stream! {
        while let Some(conn) = await_connection(&listener, cancellation_token.clone()).await? {
            yield conn;
        }
    }
}

async fn await_connection(
    listener: &Async<TcpListener>,
    cancellation_token: CancellationToken,
) -> std::io::Result<Option<(Async<TcpStream>, SocketAddr)>> {
    let mut accept = Box::pin(listener.accept().fuse());
    let mut cancelled = cancellation_token.cancelled().fuse();
    futures::select! {
        conn = accept => {
            drop(accept);
            Ok(Some(conn?))
        }
        () = cancelled => {
            Ok(None)
        }
    }
}

/// Serves process control of `runtime` on `listener` until cancellation.
///
/// Connections are served one after the other.
pub async fn serve(
    runtime: Runtime,
    listener: Async<TcpListener>,
    cancellation_token: CancellationToken,
) -> std::io::Result<()> {
    let mut connections = pin!(listen(listener, cancellation_token.clone()));
    while let Some(conn) = connections.next().await {
        let (stream, addr) = conn?;
        info!(target: "teleshell::runtime", "controller attached from {addr}");

        let attachment = runtime.attach();
        let mut connection = pin!(serve_connection(attachment.clone(), stream).fuse());
        let mut cancelled = cancellation_token.cancelled().fuse();
        futures::select! {
            () = connection => {}
            () = cancelled => {
                debug!(target: "teleshell::runtime", "debug server cancelled");
            }
        }

        if let Err(e) = attachment.dispose() {
            warn!(target: "teleshell::runtime", "cannot dispose of controller state: {e}");
        }
        info!(target: "teleshell::runtime", "controller {addr} detached");
    }
    Ok(())
}

/// Binds the debug port and serves it on a dedicated thread.
///
/// Returns the bound address, port 0 picks an ephemeral one.
pub fn spawn(
    runtime: Runtime,
    addr: SocketAddr,
    cancellation_token: CancellationToken,
) -> std::io::Result<(SocketAddr, std::thread::JoinHandle<std::io::Result<()>>)> {
    let listener = Async::<TcpListener>::bind(addr)?;
    let local_addr = listener.get_ref().local_addr()?;
    let handle = std::thread::Builder::new()
        .name("teleshell-debug-server".to_owned())
        .spawn(move || {
            let mut exec = LocalPool::new();
            exec.run_until(serve(runtime, listener, cancellation_token))
        })?;
    Ok((local_addr, handle))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        control::{ControlError, Value},
        operate::capnp::debug::RemoteVm,
    };

    #[test]
    fn test_remote_process_control() {
        let rt = Runtime::new();
        let class = rt
            .define_class("test.Remote")
            .static_method("twice", |_ctx, args| match args.first() {
                Some(Value::Int(i)) => Ok(Value::Int(i * 2)),
                _ => Ok(Value::None),
            })
            .build();
        let holder = rt
            .new_object(class, [("flag".to_owned(), Value::Bool(false))])
            .unwrap();

        let token = CancellationToken::new();
        let (addr, server) = spawn(rt.clone(), "127.0.0.1:0".parse().unwrap(), token.clone()).unwrap();

        let vm = RemoteVm::connect(TcpStream::connect(addr).unwrap()).unwrap();
        let classes = vm.classes_by_name("test.Remote").unwrap();
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].id, class);
        let methods = vm.methods_by_name(class, "twice").unwrap();
        assert_eq!(methods[0].location.line, 1);

        vm.set_field(holder, "flag", Value::Bool(true)).unwrap();
        assert_eq!(vm.get_field(holder, "flag").unwrap(), Value::Bool(true));
        assert_matches!(
            vm.get_field(holder, "missing"),
            Err(ControlError::NoSuchField(field)) if field == "missing"
        );
        assert_eq!(vm.remove_event(Duration::from_millis(20)).unwrap(), None);

        vm.suspend().unwrap();
        vm.dispose().unwrap();
        assert_matches!(vm.suspend(), Err(ControlError::Disconnected));

        token.cancel();
        server.join().unwrap().unwrap();
    }
}
