use std::{
    collections::BTreeMap,
    sync::{Arc, LazyLock, Mutex},
};

use super::{port_argument, Arguments, ConnectError, Connector};
use crate::{control::VirtualMachine, internal::lock, runtime::Runtime};

static PUBLISHED: LazyLock<Mutex<BTreeMap<u16, Runtime>>> =
    LazyLock::new(|| Mutex::new(BTreeMap::new()));

/// Attaches to a runtime of the current process published under a port number.
///
/// The host name argument is ignored.
pub struct LocalAttach;

impl LocalAttach {
    /// Makes `runtime` reachable under `port`, replacing any runtime published there.
    pub fn publish(port: u16, runtime: Runtime) {
        lock(&PUBLISHED).insert(port, runtime);
    }

    pub fn withdraw(port: u16) -> Option<Runtime> {
        lock(&PUBLISHED).remove(&port)
    }
}

impl Connector for LocalAttach {
    fn name(&self) -> &'static str {
        "teleshell.LocalAttach"
    }

    fn attach(&self, arguments: &Arguments) -> Result<Arc<dyn VirtualMachine>, ConnectError> {
        let port = port_argument(arguments)?;
        let runtime = lock(&PUBLISHED)
            .get(&port)
            .cloned()
            .ok_or_else(|| ConnectError::Refused(format!("no runtime published on {port}")))?;
        Ok(Arc::new(runtime.attach()))
    }
}
