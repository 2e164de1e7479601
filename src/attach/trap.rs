//! Trap coordination: catch the reserved thread of the target at its trap method.

use std::time::Duration;

use log::{debug, trace, warn};

use super::AttachError;
use crate::{
    contract::{AGENT_CLASS, RESERVED_THREAD_TAG, TRAP_METHOD},
    control::{ControlError, Event, Location, ThreadId, ThreadRef, VirtualMachine},
    internal::Deadline,
};

/// Longest single wait on the event queue.
const MAX_POLL: Duration = Duration::from_secs(10);

/// Finds the reserved thread by its name prefix.
pub fn find_reserved_thread(vm: &dyn VirtualMachine) -> Result<ThreadRef, AttachError> {
    vm.all_threads()
        .map_err(attach_failure)?
        .into_iter()
        .find(|t| t.name.starts_with(RESERVED_THREAD_TAG))
        .ok_or_else(|| {
            AttachError::ProtocolViolation(format!(
                "no thread named {RESERVED_THREAD_TAG}* in the target"
            ))
        })
}

/// Traps armed on the trap method of every loaded instance of the agent class.
#[derive(Debug)]
pub struct Traps {
    thread: ThreadId,
    locations: Vec<Location>,
}

impl Traps {
    /// Arms the traps, all filtered to `thread`.
    pub fn arm(vm: &dyn VirtualMachine, thread: ThreadId) -> Result<Self, AttachError> {
        let classes = vm.classes_by_name(AGENT_CLASS).map_err(attach_failure)?;
        if classes.is_empty() {
            return Err(AttachError::ProtocolViolation(format!(
                "class {AGENT_CLASS} is not loaded in the target"
            )));
        }

        let mut locations = Vec::new();
        for class in &classes {
            for method in vm
                .methods_by_name(class.id, TRAP_METHOD)
                .map_err(attach_failure)?
            {
                locations.push(method.location);
            }
        }
        if locations.is_empty() {
            return Err(AttachError::ProtocolViolation(format!(
                "{AGENT_CLASS} has no {TRAP_METHOD} method"
            )));
        }

        for location in &locations {
            let request = vm
                .create_breakpoint(location, Some(thread))
                .map_err(attach_failure)?;
            debug!(target: "teleshell::attach", "trap {request} armed at {location} for {thread}");
        }
        Ok(Self { thread, locations })
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    /// Blocks until one of the traps fires on the reserved thread, for at most `timeout`.
    ///
    /// Returns where it fired; the target is then suspended.
    pub fn wait(&self, vm: &dyn VirtualMachine, timeout: Duration) -> Result<Location, AttachError> {
        let deadline = Deadline::after(timeout);
        while let Some(left) = deadline.remaining() {
            let Some(events) = vm.remove_event(left.min(MAX_POLL)).map_err(attach_failure)? else {
                trace!(target: "teleshell::attach", "still waiting for the trap");
                continue;
            };

            let mut stray = false;
            for event in events {
                match event {
                    Event::Breakpoint {
                        thread, location, ..
                    } if thread == self.thread && self.locations.contains(&location) => {
                        debug!(target: "teleshell::attach", "trap fired at {location}");
                        return Ok(location);
                    }
                    Event::Breakpoint {
                        thread, location, ..
                    } => {
                        warn!(target: "teleshell::attach", "ignoring event at {location} on {thread}");
                        stray = true;
                    }
                    Event::VmDeath(description) => {
                        return Err(AttachError::AttachFailure(format!(
                            "target exited while attaching: {description}"
                        )));
                    }
                    Event::VmDisconnect => {
                        return Err(AttachError::AttachFailure(
                            "target disconnected while attaching".to_owned(),
                        ));
                    }
                }
            }
            if stray {
                // The event set suspended the target.
                vm.resume().map_err(attach_failure)?;
            }
        }
        Err(AttachError::HandshakeTimeout)
    }
}

fn attach_failure(e: ControlError) -> AttachError {
    AttachError::AttachFailure(e.to_string())
}
