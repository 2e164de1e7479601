use std::{
    net::{TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use log::debug;

use super::{port_argument, Arguments, ConnectError, Connector};
use crate::{
    config::PARAM_HOST_NAME, control::VirtualMachine, operate::capnp::debug::RemoteVm,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Attaches to a target debug port over TCP.
pub struct SocketAttach;

impl Connector for SocketAttach {
    fn name(&self) -> &'static str {
        "teleshell.SocketAttach"
    }

    fn attach(&self, arguments: &Arguments) -> Result<Arc<dyn VirtualMachine>, ConnectError> {
        let host = arguments
            .get(PARAM_HOST_NAME)
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConnectError::IllegalArguments(format!("missing `{PARAM_HOST_NAME}`")))?;
        let port = port_argument(arguments)?;

        let mut last_error = None;
        for addr in (host.as_str(), port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    debug!(target: "teleshell::attach", "debug port reached at {addr}");
                    stream.set_nodelay(true)?;
                    return Ok(Arc::new(RemoteVm::connect(stream)?));
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) => ConnectError::Io(e),
            None => ConnectError::Refused(format!("{host}:{port} does not resolve")),
        })
    }
}
