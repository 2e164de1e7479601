//! Managed thread side of the runtime: frames and safepoints.

use std::time::{Duration, Instant};

use log::trace;

use super::{Frame, Runtime};
use crate::control::{ControlError, Event, EventSet, Location, MethodId, ObjectId, ThreadId, Value};

/// Abnormal exit of a method.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Unwind {
    /// An object thrown through the stack, e.g. by a forced unwind.
    #[error("exception {0}")]
    Exception(ObjectId),
    /// A failure described by a message.
    #[error("{0}")]
    Error(String),
    /// The runtime exited.
    #[error("runtime exited")]
    Exited,
}

/// Execution context of a managed thread, given to its body and to every method it runs.
pub struct ThreadContext {
    runtime: Runtime,
    id: ThreadId,
}

impl ThreadContext {
    pub(super) fn new(runtime: Runtime, id: ThreadId) -> Self {
        Self { runtime, id }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Calls `method` on this thread.
    ///
    /// A frame is pushed for the duration of the call and the method entry is a safepoint where
    /// armed traps fire.
    pub fn call(
        &self,
        method: MethodId,
        this: Option<ObjectId>,
        args: Vec<Value>,
    ) -> Result<Value, Unwind> {
        let (location, body) = {
            let mut state = self.runtime.inner.lock();
            let (class, _, m) = state
                .method(method)
                .ok_or_else(|| Unwind::Error(format!("unknown {method}")))?;
            let location = Location {
                class,
                method,
                line: m.line,
            };
            let body = m.body.clone();
            if let Some(t) = state.threads.get_mut(&self.id) {
                t.frames.push(Frame { location, this });
            }
            (location, body)
        };

        let _frame = FrameGuard(self);
        self.pause(Some(location))?;
        body(self, this, args)
    }

    /// Honors process control: parks while suspended, delivers a forced unwind.
    pub fn safepoint(&self) -> Result<(), Unwind> {
        self.pause(None)
    }

    /// Sleeps for `duration`, waking early for a forced unwind.
    pub fn sleep(&self, duration: Duration) -> Result<(), Unwind> {
        let deadline = Instant::now() + duration;
        loop {
            self.safepoint()?;

            let inner = &self.runtime.inner;
            let state = inner.lock();
            let interrupted = state.suspend_count > 0
                || state.exited.is_some()
                || state
                    .threads
                    .get(&self.id)
                    .is_some_and(|t| t.pending_unwind.is_some());
            if interrupted {
                continue;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(());
            }
            let _ = inner.changed.wait_timeout(state, left);
        }
    }

    /// Discards a forced unwind which has not been delivered yet.
    pub fn clear_pending_unwind(&self) -> Option<ObjectId> {
        let mut state = self.runtime.inner.lock();
        state
            .threads
            .get_mut(&self.id)
            .and_then(|t| t.pending_unwind.take())
    }

    fn pause(&self, entering: Option<Location>) -> Result<(), Unwind> {
        let inner = &self.runtime.inner;
        let mut state = inner.lock();

        match state.threads.get(&self.id) {
            Some(t) if t.invoking > 0 => return Ok(()),
            Some(_) => {}
            None => return Ok(()),
        }

        if let Some(location) = entering {
            let events: EventSet = state
                .breakpoints
                .iter()
                .filter(|(_, bp)| {
                    bp.location == location && bp.thread.is_none_or(|thread| thread == self.id)
                })
                .map(|(request, _)| Event::Breakpoint {
                    request: *request,
                    thread: self.id,
                    location,
                })
                .collect();
            if !events.is_empty() {
                trace!(target: "teleshell::runtime", "{} trapped at {location}", self.id);
                state.events.push_back(events);
                state.suspend_count += 1;
                if let Some(t) = state.threads.get_mut(&self.id) {
                    t.event_paused = true;
                }
                inner.events_ready.notify_all();
            }
        }

        loop {
            if state.exited.is_some() {
                return Err(Unwind::Exited);
            }
            let suspended = state.suspend_count > 0;
            let Some(t) = state.threads.get_mut(&self.id) else {
                return Ok(());
            };

            if !suspended {
                t.event_paused = false;
                for invocation in t.invocations.drain(..) {
                    let _ = invocation.reply.send(Err(ControlError::IncompatibleThreadState(
                        format!("{} resumed before the invocation ran", self.id),
                    )));
                }
                return match t.pending_unwind.take() {
                    Some(exception) => Err(Unwind::Exception(exception)),
                    None => Ok(()),
                };
            }

            let invocation = if t.event_paused {
                t.invocations.pop_front()
            } else {
                None
            };
            match invocation {
                Some(invocation) => {
                    t.invoking += 1;
                    drop(state);

                    let result = self
                        .call(invocation.method, None, invocation.args)
                        .map_err(|unwind| ControlError::Invocation(unwind.to_string()));
                    let _ = invocation.reply.send(result);

                    state = inner.lock();
                    if let Some(t) = state.threads.get_mut(&self.id) {
                        t.invoking -= 1;
                    }
                }
                None => state = inner.wait(state),
            }
        }
    }
}

/// Pops the frame pushed by [`ThreadContext::call`].
struct FrameGuard<'a>(&'a ThreadContext);

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.runtime.inner.lock();
        if let Some(t) = state.threads.get_mut(&self.0.id) {
            t.frames.pop();
        }
    }
}
