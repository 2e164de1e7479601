//! Handshake: force the trapped target to dial back, then let it go.

use std::time::Duration;

use log::{debug, warn};

use super::{trap::Traps, AttachError};
use crate::{
    contract::{HandshakeArgument, ENTRY_METHOD},
    control::{ControlError, Event, Location, ThreadId, Value, VirtualMachine},
};

/// Poll used to drain the event queue.
const DRAIN_POLL: Duration = Duration::from_millis(1);

/// Releases the target on drop: disarms every trap, drains the event queue and resumes.
///
/// Held from before arming until after the entry point invocation, whatever happens in between.
pub struct HandshakeCleanup<'a> {
    vm: &'a dyn VirtualMachine,
}

impl<'a> HandshakeCleanup<'a> {
    pub fn new(vm: &'a dyn VirtualMachine) -> Self {
        Self { vm }
    }
}

impl Drop for HandshakeCleanup<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.vm.delete_all_breakpoints() {
            warn!(target: "teleshell::attach", "cannot disarm traps: {e}");
        }
        loop {
            match self.vm.remove_event(DRAIN_POLL) {
                Ok(Some(events)) => {
                    if events.iter().any(|e| matches!(e, Event::Breakpoint { .. })) {
                        if let Err(e) = self.vm.resume() {
                            warn!(target: "teleshell::attach", "cannot resume the target: {e}");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(target: "teleshell::attach", "stopped draining events: {e}");
                    break;
                }
            }
        }
        if let Err(e) = self.vm.resume() {
            warn!(target: "teleshell::attach", "cannot resume the target: {e}");
        }
    }
}

/// Forces the trapped `thread` to run the entry point of the class where the trap fired.
pub fn invoke_entry_point(
    vm: &dyn VirtualMachine,
    trapped_at: &Location,
    thread: ThreadId,
    argument: &HandshakeArgument,
) -> Result<(), AttachError> {
    let entry_point = vm
        .methods_by_name(trapped_at.class, ENTRY_METHOD)
        .map_err(remote_invocation)?
        .into_iter()
        .next()
        .ok_or_else(|| {
            AttachError::RemoteInvocation(format!("no {ENTRY_METHOD} in {}", trapped_at.class))
        })?;

    debug!(target: "teleshell::attach", "invoking {ENTRY_METHOD}(\"{argument}\") on {thread}");
    vm.invoke_method(
        thread,
        trapped_at.class,
        entry_point.id,
        vec![Value::Text(argument.to_string())],
    )
    .map_err(remote_invocation)?;
    Ok(())
}

fn remote_invocation(e: ControlError) -> AttachError {
    match e {
        ControlError::Disconnected => {
            AttachError::AttachFailure("target disconnected while attaching".to_owned())
        }
        e => AttachError::RemoteInvocation(e.to_string()),
    }
}

/// Catches the reserved thread at its trap and makes the target dial back to `argument`.
///
/// The target is resumed on return, whether the handshake succeeded or not.
pub fn run(
    vm: &dyn VirtualMachine,
    thread: ThreadId,
    argument: &HandshakeArgument,
    timeout: Duration,
) -> Result<(), AttachError> {
    let _cleanup = HandshakeCleanup::new(vm);
    let traps = Traps::arm(vm, thread)?;
    let trapped_at = traps.wait(vm, timeout)?;
    invoke_entry_point(vm, &trapped_at, thread, argument)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        attach::scripted::ScriptedVm,
        contract::{AGENT_CLASS, TRAP_METHOD},
        control::{ClassId, MethodId, RequestId},
    };

    fn trapped_vm(methods: &[(u64, &str)]) -> ScriptedVm {
        ScriptedVm::new()
            .thread(2, "teleshell-attach-listener")
            .class(10, AGENT_CLASS, methods)
            .event(vec![Event::Breakpoint {
                request: RequestId(11),
                thread: ThreadId(2),
                location: Location {
                    class: ClassId(10),
                    method: MethodId(11),
                    line: 1,
                },
            }])
    }

    fn argument() -> HandshakeArgument {
        HandshakeArgument::new("localhost", 40000)
    }

    #[test]
    fn test_handshake_invokes_and_releases() {
        let vm = trapped_vm(&[(11, TRAP_METHOD), (12, ENTRY_METHOD)]);
        run(&vm, ThreadId(2), &argument(), Duration::from_secs(5)).unwrap();

        let calls = vm.calls();
        assert!(calls.contains(
            &"invoke_method thread#2 class#10 method#12 (\"localhost:40000\")".to_owned()
        ));
        let invoked = calls.iter().position(|c| c.starts_with("invoke_method"));
        let disarmed = calls.iter().position(|c| c == "delete_all_breakpoints");
        assert!(invoked < disarmed);
        assert_eq!(calls.last().map(String::as_str), Some("resume"));
        assert_eq!(vm.suspend_count(), 0);
    }

    #[test]
    fn test_missing_entry_point_still_resumes() {
        let vm = trapped_vm(&[(11, TRAP_METHOD)]);
        assert_matches!(
            run(&vm, ThreadId(2), &argument(), Duration::from_secs(5)),
            Err(AttachError::RemoteInvocation(_))
        );
        assert!(vm.calls().contains(&"delete_all_breakpoints".to_owned()));
        assert_eq!(vm.suspend_count(), 0);
    }

    #[test]
    fn test_failed_invocation_still_resumes() {
        let vm = trapped_vm(&[(11, TRAP_METHOD), (12, ENTRY_METHOD)]).invocation_result(Err(
            ControlError::IncompatibleThreadState("thread#2 is not paused by an event".to_owned()),
        ));
        assert_matches!(
            run(&vm, ThreadId(2), &argument(), Duration::from_secs(5)),
            Err(AttachError::RemoteInvocation(_))
        );
        assert_eq!(vm.suspend_count(), 0);
    }

    #[test]
    fn test_timeout_does_not_invoke() {
        let vm = ScriptedVm::new()
            .thread(2, "teleshell-attach-listener")
            .class(10, AGENT_CLASS, &[(11, TRAP_METHOD), (12, ENTRY_METHOD)]);
        assert_matches!(
            run(&vm, ThreadId(2), &argument(), Duration::from_millis(30)),
            Err(AttachError::HandshakeTimeout)
        );
        assert!(!vm.calls().iter().any(|c| c.starts_with("invoke_method")));
        assert!(vm.calls().contains(&"delete_all_breakpoints".to_owned()));
    }
}
