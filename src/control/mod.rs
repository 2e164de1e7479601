//! Process-control interface.
//!
//! [`VirtualMachine`] is the set of operations the controller needs from the target: thread and
//! class enumeration, location traps, an event queue, whole-process suspension, forced
//! invocation, field access and forced unwind. Identities are opaque ids allocated by the target.

use std::{fmt, time::Duration};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Identity of a thread of the target.
    ThreadId,
    "thread"
);
id_type!(
    /// Identity of one loaded instance of a class.
    ClassId,
    "class"
);
id_type!(
    /// Identity of a method of a loaded class.
    MethodId,
    "method"
);
id_type!(
    /// Identity of an object living in the target.
    ObjectId,
    "object"
);
id_type!(
    /// Identity of an armed trap.
    RequestId,
    "request"
);

/// A place in the target where execution can be trapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub class: ClassId,
    pub method: MethodId,
    pub line: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.class, self.method, self.line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRef {
    pub id: ThreadId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRef {
    pub id: ClassId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRef {
    pub id: MethodId,
    pub name: String,
    /// Entry location of the method.
    pub location: Location,
}

/// One frame of a thread call stack, top of the stack first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub location: Location,
    pub declaring_type: String,
    pub method: String,
    /// Receiver of the frame, `None` for static methods.
    pub this: Option<ObjectId>,
}

/// A value exchanged with the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Text(String),
    Object(ObjectId),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Text(_) => "text",
            Value::Object(_) => "object",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("none"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Object(id) => write!(f, "{id}"),
        }
    }
}

/// Something that happened in the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An armed trap fired. The whole target is suspended when this is reported.
    Breakpoint {
        request: RequestId,
        thread: ThreadId,
        location: Location,
    },
    /// The target exited, with a description.
    VmDeath(String),
    /// The attachment is gone.
    VmDisconnect,
}

/// Events reported together.
pub type EventSet = Vec<Event>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("incompatible thread state: {0}")]
    IncompatibleThreadState(String),
    #[error("invalid type: {0}")]
    InvalidType(String),
    #[error("no such field `{0}`")]
    NoSuchField(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("exception in target: {0}")]
    Invocation(String),
    #[error("class not loaded: {0}")]
    ClassNotLoaded(String),
    #[error("target disconnected")]
    Disconnected,
    #[error("transport error: {0}")]
    Transport(String),
}

impl ControlError {
    /// Short tag identifying the kind of error on the debug wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::IncompatibleThreadState(_) => "thread-state",
            ControlError::InvalidType(_) => "invalid-type",
            ControlError::NoSuchField(_) => "no-such-field",
            ControlError::InvalidArgument(_) => "invalid-argument",
            ControlError::Invocation(_) => "invocation",
            ControlError::ClassNotLoaded(_) => "class-not-loaded",
            ControlError::Disconnected => "disconnected",
            ControlError::Transport(_) => "transport",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            ControlError::IncompatibleThreadState(s)
            | ControlError::InvalidType(s)
            | ControlError::NoSuchField(s)
            | ControlError::InvalidArgument(s)
            | ControlError::Invocation(s)
            | ControlError::ClassNotLoaded(s)
            | ControlError::Transport(s) => s,
            ControlError::Disconnected => "",
        }
    }

    /// Rebuilds an error from its [kind](ControlError::kind) and [detail](ControlError::detail).
    pub fn from_kind(kind: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match kind {
            "thread-state" => ControlError::IncompatibleThreadState(detail),
            "invalid-type" => ControlError::InvalidType(detail),
            "no-such-field" => ControlError::NoSuchField(detail),
            "invalid-argument" => ControlError::InvalidArgument(detail),
            "invocation" => ControlError::Invocation(detail),
            "class-not-loaded" => ControlError::ClassNotLoaded(detail),
            "disconnected" => ControlError::Disconnected,
            _ => ControlError::Transport(detail),
        }
    }
}

/// Process-control capability over one attached target.
///
/// All operations are blocking. Implementations must be usable from several threads at once:
/// the death watcher pulls events while the foreground caller suspends and inspects.
pub trait VirtualMachine: Send + Sync {
    /// Live threads of the target.
    fn all_threads(&self) -> Result<Vec<ThreadRef>, ControlError>;

    /// Every loaded instance of the class with the given qualified name.
    fn classes_by_name(&self, name: &str) -> Result<Vec<ClassRef>, ControlError>;

    fn methods_by_name(&self, class: ClassId, name: &str) -> Result<Vec<MethodRef>, ControlError>;

    /// Arms a trap on `location`, restricted to `thread` when given.
    fn create_breakpoint(
        &self,
        location: &Location,
        thread: Option<ThreadId>,
    ) -> Result<RequestId, ControlError>;

    fn delete_all_breakpoints(&self) -> Result<(), ControlError>;

    /// Pulls the next event set, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    fn remove_event(&self, timeout: Duration) -> Result<Option<EventSet>, ControlError>;

    /// Suspends the whole target. Suspensions are counted.
    fn suspend(&self) -> Result<(), ControlError>;

    /// Undoes one suspension, or resumes a target paused by an event.
    fn resume(&self) -> Result<(), ControlError>;

    /// Forces `thread`, which must be paused by an event, to invoke a static method.
    fn invoke_method(
        &self,
        thread: ThreadId,
        class: ClassId,
        method: MethodId,
        args: Vec<Value>,
    ) -> Result<Value, ControlError>;

    /// Call stack of a suspended thread, top first.
    fn frames(&self, thread: ThreadId) -> Result<Vec<StackFrame>, ControlError>;

    fn get_field(&self, object: ObjectId, field: &str) -> Result<Value, ControlError>;

    fn set_field(&self, object: ObjectId, field: &str, value: Value) -> Result<(), ControlError>;

    /// Forces `thread` to unwind by throwing `exception`.
    fn stop_thread(&self, thread: ThreadId, exception: ObjectId) -> Result<(), ControlError>;

    /// Drops the attachment: traps are deleted and the target is resumed, never killed.
    fn dispose(&self) -> Result<(), ControlError>;
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_roundtrip() {
        let errors = [
            ControlError::IncompatibleThreadState("running".to_owned()),
            ControlError::InvalidType("bool expected".to_owned()),
            ControlError::NoSuchField("inClientCode".to_owned()),
            ControlError::Invocation("boom".to_owned()),
            ControlError::Disconnected,
        ];
        for error in errors {
            assert_eq!(ControlError::from_kind(error.kind(), error.detail()), error);
        }
        assert_eq!(
            ControlError::from_kind("whatever", "lost"),
            ControlError::Transport("lost".to_owned())
        );
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Int(3).as_bool(), None);
        assert_eq!(Value::Object(ObjectId(7)).as_object(), Some(ObjectId(7)));
        assert_eq!(Value::Text("x".to_owned()).to_string(), "\"x\"");
        assert_eq!(ThreadId(4).to_string(), "thread#4");
    }
}
