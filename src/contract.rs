//! Structural contract between the controller and the agent running in the target.
//!
//! Both sides agree on these names statically. Changing any of them is a protocol change and must
//! bump [`PROTOCOL_VERSION`].

use std::{fmt, str::FromStr};

use crate::control::{ControlError, ObjectId, StackFrame, Value, VirtualMachine};

/// Version exchanged in the channel preamble.
pub const PROTOCOL_VERSION: u16 = 1;

/// Prefix of the name of the reserved thread which loops on the trap method.
pub const RESERVED_THREAD_TAG: &str = "teleshell-attach";

/// Qualified name of the class holding the trap method and the entry point.
pub const AGENT_CLASS: &str = "teleshell.agent.RemoteAgent";

/// No-op method called by the reserved thread, twice per polling cycle.
pub const TRAP_METHOD: &str = "breakpointMethod";

/// Static entry point taking the `host:port` handshake argument.
pub const ENTRY_METHOD: &str = "main0";

/// Loop run by the reserved thread.
pub const LOOP_METHOD: &str = "loopWaitingForAttach";

/// Default qualified name of the type executing snippets.
pub const DEFAULT_EXECUTOR_TYPE: &str = "teleshell.agent.SnippetExecutor";

/// Qualified name of the pre-allocated stop exception type.
pub const STOP_EXCEPTION_TYPE: &str = "teleshell.agent.StopException";

/// Methods of the executor type which run user code.
pub const USER_CODE_METHODS: [&str; 2] = ["invoke", "varValue"];

/// Recognizes the frame of a snippet executing on behalf of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCodeMarker {
    declaring_type: String,
}

impl UserCodeMarker {
    pub fn new(declaring_type: impl Into<String>) -> Self {
        Self {
            declaring_type: declaring_type.into(),
        }
    }

    pub fn declaring_type(&self) -> &str {
        &self.declaring_type
    }

    pub fn matches(&self, frame: &StackFrame) -> bool {
        frame.declaring_type == self.declaring_type
            && USER_CODE_METHODS.contains(&frame.method.as_str())
    }
}

/// Shared stop state, held as fields of the executor object.
///
/// | field           | type   | written by                                           |
/// |-----------------|--------|------------------------------------------------------|
/// | `inClientCode`  | bool   | target, around user code                             |
/// | `expectingStop` | bool   | controller, set before and cleared after the unwind  |
/// | `stopException` | object | target, once; thrown into the thread by the controller |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopState {
    pub in_client_code: bool,
    pub expecting_stop: bool,
    pub stop_exception: ObjectId,
}

impl StopState {
    pub const IN_CLIENT_CODE: &'static str = "inClientCode";
    pub const EXPECTING_STOP: &'static str = "expectingStop";
    pub const STOP_EXCEPTION: &'static str = "stopException";

    /// Initial state of a freshly created executor.
    pub fn idle(stop_exception: ObjectId) -> Self {
        Self {
            in_client_code: false,
            expecting_stop: false,
            stop_exception,
        }
    }

    /// Tagged fields, as stored in the executor object.
    pub fn fields(&self) -> Vec<(String, Value)> {
        vec![
            (
                Self::IN_CLIENT_CODE.to_owned(),
                Value::Bool(self.in_client_code),
            ),
            (
                Self::EXPECTING_STOP.to_owned(),
                Value::Bool(self.expecting_stop),
            ),
            (
                Self::STOP_EXCEPTION.to_owned(),
                Value::Object(self.stop_exception),
            ),
        ]
    }

    /// Reads the state of `object`.
    pub fn read(vm: &dyn VirtualMachine, object: ObjectId) -> Result<Self, ControlError> {
        Ok(Self {
            in_client_code: read_bool(vm, object, Self::IN_CLIENT_CODE)?,
            expecting_stop: read_bool(vm, object, Self::EXPECTING_STOP)?,
            stop_exception: vm
                .get_field(object, Self::STOP_EXCEPTION)?
                .as_object()
                .ok_or_else(|| {
                    ControlError::InvalidType(format!("{} is not an object", Self::STOP_EXCEPTION))
                })?,
        })
    }
}

fn read_bool(vm: &dyn VirtualMachine, object: ObjectId, field: &str) -> Result<bool, ControlError> {
    vm.get_field(object, field)?
        .as_bool()
        .ok_or_else(|| ControlError::InvalidType(format!("{field} is not a bool")))
}

/// The `host:port` string handed to the entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeArgument {
    pub host: String,
    pub port: u16,
}

impl HandshakeArgument {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HandshakeArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed handshake argument `{0}`, expected host:port")]
pub struct MalformedHandshake(pub String);

impl FromStr for HandshakeArgument {
    type Err = MalformedHandshake;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| MalformedHandshake(s.to_owned()))?;
        if host.is_empty() {
            return Err(MalformedHandshake(s.to_owned()));
        }
        let port = port.parse().map_err(|_| MalformedHandshake(s.to_owned()))?;
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::control::{ClassId, Location, MethodId};

    fn frame(declaring_type: &str, method: &str) -> StackFrame {
        StackFrame {
            location: Location {
                class: ClassId(1),
                method: MethodId(2),
                line: 1,
            },
            declaring_type: declaring_type.to_owned(),
            method: method.to_owned(),
            this: None,
        }
    }

    #[test]
    fn test_user_code_marker() {
        let marker = UserCodeMarker::new(DEFAULT_EXECUTOR_TYPE);
        assert!(marker.matches(&frame(DEFAULT_EXECUTOR_TYPE, "invoke")));
        assert!(marker.matches(&frame(DEFAULT_EXECUTOR_TYPE, "varValue")));
        assert!(!marker.matches(&frame(DEFAULT_EXECUTOR_TYPE, "main0")));
        assert!(!marker.matches(&frame(AGENT_CLASS, "invoke")));
    }

    #[test]
    fn test_handshake_argument() {
        let arg: HandshakeArgument = "localhost:4321".parse().unwrap();
        assert_eq!(arg, HandshakeArgument::new("localhost", 4321));
        assert_eq!(arg.to_string(), "localhost:4321");
        assert_matches!("localhost".parse::<HandshakeArgument>(), Err(_));
        assert_matches!(":12".parse::<HandshakeArgument>(), Err(_));
        assert_matches!("host:99999".parse::<HandshakeArgument>(), Err(_));
    }

    #[test]
    fn test_stop_state_fields() {
        let fields = StopState::idle(ObjectId(9)).fields();
        assert_eq!(fields.len(), 3);
        assert!(fields.contains(&(StopState::STOP_EXCEPTION.to_owned(), Value::Object(ObjectId(9)))));
        assert!(fields.contains(&(StopState::IN_CLIENT_CODE.to_owned(), Value::Bool(false))));
    }
}
