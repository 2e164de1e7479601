//! Connection parameters of an attach session.

use std::{collections::HashMap, time::Duration};

use crate::contract::DEFAULT_EXECUTOR_TYPE;

pub const PARAM_HOST_NAME: &str = "hostname";
pub const PARAM_PORT: &str = "port";
pub const PARAM_REMOTE_AGENT: &str = "remoteAgent";
pub const PARAM_TIMEOUT: &str = "timeout";
pub const PARAM_CONNECTOR: &str = "connector";

pub const DEFAULT_HOST_NAME: &str = "localhost";
pub const DEFAULT_PORT: u16 = 4568;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_CONNECTOR: &str = "teleshell.SocketAttach";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("parameter `{name}` has invalid value `{value}`")]
    InvalidValue { name: &'static str, value: String },
}

/// Where and how to attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Host of the target debug port.
    pub hostname: String,
    /// Target debug port.
    pub port: u16,
    /// Qualified name of the type executing snippets in the target.
    pub remote_agent: String,
    /// Bounds the trap wait and the dial-back accept.
    pub timeout: Duration,
    /// Name of the process-control connector.
    pub connector: String,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOST_NAME.to_owned(),
            port: DEFAULT_PORT,
            remote_agent: DEFAULT_EXECUTOR_TYPE.to_owned(),
            timeout: DEFAULT_TIMEOUT,
            connector: DEFAULT_CONNECTOR.to_owned(),
        }
    }
}

impl ConnectionParams {
    /// Builds parameters from a string map, missing keys taking their default.
    ///
    /// The timeout is given in milliseconds.
    pub fn from_map(parameters: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut params = Self::default();
        if let Some(hostname) = parameters.get(PARAM_HOST_NAME) {
            params.hostname = hostname.clone();
        }
        if let Some(port) = parameters.get(PARAM_PORT) {
            params.port = parse(PARAM_PORT, port)?;
        }
        if let Some(remote_agent) = parameters.get(PARAM_REMOTE_AGENT) {
            params.remote_agent = remote_agent.clone();
        }
        if let Some(timeout) = parameters.get(PARAM_TIMEOUT) {
            params.timeout = Duration::from_millis(parse(PARAM_TIMEOUT, timeout)?);
        }
        if let Some(connector) = parameters.get(PARAM_CONNECTOR) {
            params.connector = connector.clone();
        }
        Ok(params)
    }

    /// The default parameters as a string map.
    pub fn default_parameters() -> HashMap<String, String> {
        let defaults = Self::default();
        HashMap::from([
            (PARAM_HOST_NAME.to_owned(), defaults.hostname),
            (PARAM_PORT.to_owned(), defaults.port.to_string()),
            (PARAM_REMOTE_AGENT.to_owned(), defaults.remote_agent),
            (
                PARAM_TIMEOUT.to_owned(),
                defaults.timeout.as_millis().to_string(),
            ),
            (PARAM_CONNECTOR.to_owned(), defaults.connector),
        ])
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: value.to_owned(),
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_defaults() {
        let params = ConnectionParams::from_map(&HashMap::new()).unwrap();
        assert_eq!(params, ConnectionParams::default());
        assert_eq!(params.hostname, "localhost");
        assert_eq!(params.port, 4568);
        assert_eq!(params.timeout, Duration::from_secs(30));
        assert_eq!(
            ConnectionParams::from_map(&ConnectionParams::default_parameters()).unwrap(),
            params
        );
    }

    #[test]
    fn test_overrides() {
        let map = HashMap::from([
            (PARAM_HOST_NAME.to_owned(), "target.local".to_owned()),
            (PARAM_TIMEOUT.to_owned(), "10000".to_owned()),
            (PARAM_REMOTE_AGENT.to_owned(), "my.Executor".to_owned()),
        ]);
        let params = ConnectionParams::from_map(&map).unwrap();
        assert_eq!(params.hostname, "target.local");
        assert_eq!(params.port, DEFAULT_PORT);
        assert_eq!(params.timeout, Duration::from_secs(10));
        assert_eq!(params.remote_agent, "my.Executor");
    }

    #[test]
    fn test_invalid_values() {
        let map = HashMap::from([(PARAM_PORT.to_owned(), "70000".to_owned())]);
        assert_matches!(
            ConnectionParams::from_map(&map),
            Err(ConfigError::InvalidValue { name: "port", .. })
        );
        let map = HashMap::from([(PARAM_TIMEOUT.to_owned(), "-1".to_owned())]);
        assert_matches!(
            ConnectionParams::from_map(&map),
            Err(ConfigError::InvalidValue { name: "timeout", .. })
        );
    }
}
