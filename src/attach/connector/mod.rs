//! Process-control connectors.
//!
//! A connector turns a set of string arguments into an attached [`VirtualMachine`]. Two are
//! provided:
//!
//! * [`socket::SocketAttach`] (`teleshell.SocketAttach`) reaches a target debug port over TCP
//! * [`local::LocalAttach`] (`teleshell.LocalAttach`) reaches a runtime published in the current
//!   process, keyed by port

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    config::{ConnectionParams, PARAM_HOST_NAME, PARAM_PORT},
    control::VirtualMachine,
};

pub mod local;
pub mod socket;

/// Connector arguments, by name.
pub type Arguments = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("illegal connector argument: {0}")]
    IllegalArguments(String),
    #[error("nothing to attach to: {0}")]
    Refused(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait Connector: Send + Sync {
    /// Qualified name used to select the connector.
    fn name(&self) -> &'static str;

    /// Arguments understood by the connector, with their default value.
    fn default_arguments(&self) -> Arguments {
        let defaults = ConnectionParams::default();
        Arguments::from([
            (PARAM_HOST_NAME.to_owned(), defaults.hostname),
            (PARAM_PORT.to_owned(), defaults.port.to_string()),
        ])
    }

    fn attach(&self, arguments: &Arguments) -> Result<Arc<dyn VirtualMachine>, ConnectError>;
}

/// Every available connector.
pub fn all_connectors() -> Vec<Box<dyn Connector>> {
    vec![Box::new(socket::SocketAttach), Box::new(local::LocalAttach)]
}

pub fn find_connector(name: &str) -> Option<Box<dyn Connector>> {
    all_connectors().into_iter().find(|c| c.name() == name)
}

/// Fills the connector arguments from the connection parameters.
pub fn arguments_for(connector: &dyn Connector, params: &ConnectionParams) -> Arguments {
    let mut arguments = connector.default_arguments();
    arguments.insert(PARAM_HOST_NAME.to_owned(), params.hostname.clone());
    arguments.insert(PARAM_PORT.to_owned(), params.port.to_string());
    arguments
}

pub(crate) fn port_argument(arguments: &Arguments) -> Result<u16, ConnectError> {
    let port = arguments
        .get(PARAM_PORT)
        .ok_or_else(|| ConnectError::IllegalArguments(format!("missing `{PARAM_PORT}`")))?;
    port.parse()
        .map_err(|_| ConnectError::IllegalArguments(format!("`{PARAM_PORT}` = `{port}`")))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::config::DEFAULT_CONNECTOR;

    #[test]
    fn test_registry() {
        let names: Vec<_> = all_connectors().iter().map(|c| c.name()).collect();
        assert_eq!(names, ["teleshell.SocketAttach", "teleshell.LocalAttach"]);
        assert_eq!(
            find_connector(DEFAULT_CONNECTOR).map(|c| c.name()),
            Some(DEFAULT_CONNECTOR)
        );
        assert!(find_connector("teleshell.ProcessAttach").is_none());
    }

    #[test]
    fn test_arguments() {
        let connector = socket::SocketAttach;
        let params = ConnectionParams {
            port: 7777,
            ..Default::default()
        };
        let arguments = arguments_for(&connector, &params);
        assert_eq!(arguments[PARAM_HOST_NAME], "localhost");
        assert_eq!(port_argument(&arguments).unwrap(), 7777);

        let bad = Arguments::from([(PARAM_PORT.to_owned(), "http".to_owned())]);
        assert_matches!(port_argument(&bad), Err(ConnectError::IllegalArguments(_)));
        assert_matches!(
            port_argument(&Arguments::new()),
            Err(ConnectError::IllegalArguments(_))
        );
    }
}
