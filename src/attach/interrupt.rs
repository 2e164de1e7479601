//! Remote interrupt of the snippet running in the target.
//!
//! A snippet request moves the session from idle to running for its whole duration, see
//! [`Interrupter::begin`]. [`Interrupter::stop`] holds the same lock throughout, so a request
//! cannot end while a stop manipulates the target.

use std::sync::Mutex;

use log::{debug, warn};

use crate::{
    contract::{StopState, UserCodeMarker},
    control::{ControlError, ObjectId, ThreadId, Value, VirtualMachine},
    internal::lock,
};

pub struct Interrupter {
    /// Number of snippet requests in flight.
    running: Mutex<u32>,
    marker: UserCodeMarker,
}

/// A snippet request in flight; dropping it returns to idle.
pub struct Running<'a>(&'a Interrupter);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        let mut running = lock(&self.0.running);
        *running = running.saturating_sub(1);
    }
}

/// Whole-process suspension, resumed on drop unless resumed explicitly.
struct Suspension<'a> {
    vm: &'a dyn VirtualMachine,
    held: bool,
}

impl<'a> Suspension<'a> {
    fn new(vm: &'a dyn VirtualMachine) -> Result<Self, ControlError> {
        vm.suspend()?;
        Ok(Self { vm, held: true })
    }

    fn resume_now(&mut self) -> Result<(), ControlError> {
        self.held = false;
        self.vm.resume()
    }
}

impl Drop for Suspension<'_> {
    fn drop(&mut self) {
        if self.held {
            if let Err(e) = self.vm.resume() {
                warn!(target: "teleshell::attach", "cannot resume the target: {e}");
            }
        }
    }
}

impl Interrupter {
    pub fn new(marker: UserCodeMarker) -> Self {
        Self {
            running: Mutex::new(0),
            marker,
        }
    }

    pub fn marker(&self) -> &UserCodeMarker {
        &self.marker
    }

    pub fn begin(&self) -> Running<'_> {
        *lock(&self.running) += 1;
        Running(self)
    }

    pub fn is_running(&self) -> bool {
        *lock(&self.running) > 0
    }

    /// Stops the snippet running in the target.
    ///
    /// Does nothing when idle. Otherwise the target is suspended while looking for the user
    /// code frame, and is always resumed on return. Returns whether a forced unwind was
    /// delivered.
    pub fn stop(&self, vm: &dyn VirtualMachine) -> Result<bool, ControlError> {
        let running = lock(&self.running);
        if *running == 0 {
            debug!(target: "teleshell::attach", "stop requested while idle");
            return Ok(false);
        }

        let mut suspension = Suspension::new(vm)?;
        let Some((thread, executor)) = self.find_user_code(vm)? else {
            debug!(target: "teleshell::attach", "no user code frame found");
            return Ok(false);
        };

        let in_client_code = vm
            .get_field(executor, StopState::IN_CLIENT_CODE)?
            .as_bool()
            .ok_or_else(|| {
                ControlError::InvalidType(format!("{} is not a bool", StopState::IN_CLIENT_CODE))
            })?;
        if !in_client_code {
            debug!(target: "teleshell::attach", "{thread} is not running user code");
            return Ok(false);
        }

        vm.set_field(executor, StopState::EXPECTING_STOP, Value::Bool(true))?;
        let unwound = stop_thread(vm, &mut suspension, thread, executor);
        let cleared = vm.set_field(executor, StopState::EXPECTING_STOP, Value::Bool(false));
        unwound?;
        cleared?;

        debug!(target: "teleshell::attach", "stopped user code on {thread}");
        Ok(true)
    }

    /// First frame of any thread matching the user code marker, with its receiver.
    fn find_user_code(
        &self,
        vm: &dyn VirtualMachine,
    ) -> Result<Option<(ThreadId, ObjectId)>, ControlError> {
        for thread in vm.all_threads()? {
            for frame in vm.frames(thread.id)? {
                if self.marker.matches(&frame) {
                    if let Some(this) = frame.this {
                        return Ok(Some((thread.id, this)));
                    }
                }
            }
        }
        Ok(None)
    }
}

/// Resumes the target and unwinds `thread` with the executor's stop exception.
///
/// The unwind is delivered to a running target.
fn stop_thread(
    vm: &dyn VirtualMachine,
    suspension: &mut Suspension<'_>,
    thread: ThreadId,
    executor: ObjectId,
) -> Result<(), ControlError> {
    let stop_exception = vm
        .get_field(executor, StopState::STOP_EXCEPTION)?
        .as_object()
        .ok_or_else(|| {
            ControlError::InvalidType(format!("{} is not an object", StopState::STOP_EXCEPTION))
        })?;
    suspension.resume_now()?;
    vm.stop_thread(thread, stop_exception)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        attach::scripted::ScriptedVm,
        contract::{DEFAULT_EXECUTOR_TYPE, LOOP_METHOD},
    };

    fn interrupter() -> Interrupter {
        Interrupter::new(UserCodeMarker::new(DEFAULT_EXECUTOR_TYPE))
    }

    fn executor_vm(in_client_code: bool) -> ScriptedVm {
        ScriptedVm::new()
            .thread(1, "teleshell-attach-listener")
            .thread(2, "teleshell-executor")
            .stack(1, &[("teleshell.agent.RemoteAgent", LOOP_METHOD, None)])
            .stack(2, &[(DEFAULT_EXECUTOR_TYPE, "invoke", Some(7))])
            .field(7, StopState::IN_CLIENT_CODE, Value::Bool(in_client_code))
            .field(7, StopState::EXPECTING_STOP, Value::Bool(false))
            .field(7, StopState::STOP_EXCEPTION, Value::Object(ObjectId(8)))
    }

    #[test]
    fn test_stop_while_idle_does_not_touch_the_target() {
        let vm = executor_vm(true);
        assert_eq!(interrupter().stop(&vm), Ok(false));
        assert!(vm.calls().is_empty());
    }

    #[test]
    fn test_stop_sequence() {
        let vm = executor_vm(true);
        let interrupter = interrupter();
        let _running = interrupter.begin();
        assert_eq!(interrupter.stop(&vm), Ok(true));
        assert_eq!(
            vm.calls(),
            [
                "suspend",
                "all_threads",
                "frames thread#1",
                "frames thread#2",
                "get_field object#7 inClientCode",
                "set_field object#7 expectingStop=true",
                "get_field object#7 stopException",
                "resume",
                "stop_thread thread#2 object#8",
                "set_field object#7 expectingStop=false",
            ]
        );
        assert_eq!(vm.suspend_count(), 0);
        assert_eq!(
            vm.field_value(7, StopState::EXPECTING_STOP),
            Some(Value::Bool(false))
        );
    }

    #[test]
    fn test_stop_outside_client_code_only_resumes() {
        let vm = executor_vm(false);
        let interrupter = interrupter();
        let _running = interrupter.begin();
        assert_eq!(interrupter.stop(&vm), Ok(false));
        assert!(!vm.calls().iter().any(|c| c.starts_with("set_field")));
        assert_eq!(vm.calls().last().map(String::as_str), Some("resume"));
        assert_eq!(vm.suspend_count(), 0);
    }

    #[test]
    fn test_stop_resumes_after_a_failed_scan() {
        let vm = executor_vm(true).failing(
            "frames",
            ControlError::IncompatibleThreadState("thread#1 is not suspended".to_owned()),
        );
        let interrupter = interrupter();
        let _running = interrupter.begin();
        assert_matches!(
            interrupter.stop(&vm),
            Err(ControlError::IncompatibleThreadState(_))
        );
        assert_eq!(vm.calls().last().map(String::as_str), Some("resume"));
        assert_eq!(vm.suspend_count(), 0);
    }

    #[test]
    fn test_stop_clears_expecting_stop_when_unwind_fails() {
        let vm = executor_vm(true).failing(
            "stop_thread",
            ControlError::InvalidArgument("unknown thread#2".to_owned()),
        );
        let interrupter = interrupter();
        let _running = interrupter.begin();
        assert_matches!(
            interrupter.stop(&vm),
            Err(ControlError::InvalidArgument(_))
        );
        assert_eq!(
            vm.field_value(7, StopState::EXPECTING_STOP),
            Some(Value::Bool(false))
        );
        assert_eq!(vm.suspend_count(), 0);
    }

    #[test]
    fn test_running_guard() {
        let interrupter = interrupter();
        assert!(!interrupter.is_running());
        {
            let _running = interrupter.begin();
            assert!(interrupter.is_running());
        }
        assert!(!interrupter.is_running());
    }
}
