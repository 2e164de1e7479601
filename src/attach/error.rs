use crate::{
    attach::connector::ConnectError,
    config::ConfigError,
    contract::MalformedHandshake,
    control::ControlError,
    operate::capnp::execution::CallError,
};

/// Reasons an attach can fail. Each kind calls for a different remedy from the caller.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    /// The connector could not reach the target, or the target went away while attaching.
    #[error("cannot attach: {0}")]
    AttachFailure(String),
    /// The target does not honor the structural contract.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// No trap fired in time.
    #[error("timed out waiting for the target to reach its trap")]
    HandshakeTimeout,
    /// The forced invocation of the entry point failed.
    #[error("remote invocation failed: {0}")]
    RemoteInvocation(String),
    /// The target did not dial back in time.
    #[error("timed out waiting for the target to connect back")]
    ChannelTimeout,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ConnectError> for AttachError {
    fn from(e: ConnectError) -> Self {
        AttachError::AttachFailure(e.to_string())
    }
}

impl From<MalformedHandshake> for AttachError {
    fn from(e: MalformedHandshake) -> Self {
        AttachError::ProtocolViolation(e.to_string())
    }
}

/// Reasons a snippet request or a stop can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// The snippet failed in the target.
    #[error("{0}")]
    Run(String),
    /// The snippet was stopped.
    #[error("stopped")]
    Stopped,
    /// The target is gone or the session is closed.
    #[error("engine terminated")]
    EngineTerminated,
    /// The process-control interface or the channel misbehaved.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ControlError> for ExecutionError {
    fn from(e: ControlError) -> Self {
        match e {
            ControlError::Disconnected => ExecutionError::EngineTerminated,
            e => ExecutionError::Internal(e.to_string()),
        }
    }
}

impl From<CallError> for ExecutionError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Disconnected => ExecutionError::EngineTerminated,
            CallError::Failed(message) => ExecutionError::Internal(message),
        }
    }
}
