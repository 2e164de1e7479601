//! Companion agent living in the target.
//!
//! [`Agent::install`] defines three classes in a [`Runtime`]:
//!
//! * the agent class, with the trap method, the loop of the reserved thread and the entry point
//!   `main0(host:port)`
//! * the executor class, whose `invoke` and `varValue` methods run snippets and whose objects
//!   carry the stop state
//! * the stop exception class
//!
//! and starts the reserved thread. When the entry point is invoked, a worker thread dials the
//! controller back, serves the execution wire and becomes the executor: every snippet runs on
//! it, inside a frame of the executor class.

use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{Receiver, RecvTimeoutError},
        Arc, Mutex, OnceLock,
    },
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    attach::channel,
    config::DEFAULT_TIMEOUT,
    contract::{
        HandshakeArgument, StopState, AGENT_CLASS, DEFAULT_EXECUTOR_TYPE, ENTRY_METHOD,
        LOOP_METHOD, RESERVED_THREAD_TAG, STOP_EXCEPTION_TYPE, TRAP_METHOD,
    },
    control::{ClassId, ControlError, MethodId, ObjectId, ThreadId, Value, VirtualMachine},
    internal::lock,
    operate::capnp::execution::{serve_agent, AgentStreams, Job, Outcome, Request, IN},
    runtime::{Runtime, ThreadContext, Unwind},
};

pub mod snippet;

use snippet::{Host, Interpreter, SnippetError};

/// Half of the reserved thread polling cycle.
const TRAP_PERIOD: Duration = Duration::from_millis(250);

/// How often the executor checks process control while waiting for requests.
const JOB_POLL: Duration = Duration::from_millis(50);

/// Polling of the stop state while the controller expects a stop.
const STOP_POLL: Duration = Duration::from_millis(1);

const INVOKE_METHOD: &str = "invoke";
const VAR_VALUE_METHOD: &str = "varValue";

/// Handle on an agent installed in a runtime.
pub struct Agent {
    agent_class: ClassId,
    executor_class: ClassId,
    reserved_thread: ThreadId,
}

struct Shared {
    stop_class: ClassId,
    executor_class: OnceLock<ClassId>,
    executors: Mutex<HashMap<ObjectId, Arc<Executor>>>,
    workers: AtomicU64,
}

/// State of one executor object.
struct Executor {
    streams: AgentStreams,
    interpreter: Mutex<Interpreter>,
    pending_input: Mutex<Vec<u8>>,
}

impl Agent {
    /// Installs the agent with the default executor type.
    pub fn install(runtime: &Runtime) -> io::Result<Self> {
        Self::install_with(runtime, DEFAULT_EXECUTOR_TYPE)
    }

    /// Installs the agent, snippets running in methods of `executor_type`.
    pub fn install_with(runtime: &Runtime, executor_type: &str) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            stop_class: runtime.define_class(STOP_EXCEPTION_TYPE).build(),
            executor_class: OnceLock::new(),
            executors: Mutex::new(HashMap::new()),
            workers: AtomicU64::new(0),
        });

        let executor_class = runtime
            .define_class(executor_type)
            .method(INVOKE_METHOD, {
                let shared = shared.clone();
                move |ctx, this, args| {
                    let source = text_argument(&args, INVOKE_METHOD)?;
                    shared.run_user_code(ctx, this, |executor, host| {
                        lock(&executor.interpreter).run(&source, host)
                    })
                }
            })
            .method(VAR_VALUE_METHOD, {
                let shared = shared.clone();
                move |ctx, this, args| {
                    let name = text_argument(&args, VAR_VALUE_METHOD)?;
                    shared.run_user_code(ctx, this, |executor, _host| {
                        lock(&executor.interpreter)
                            .var(&name)
                            .map(ToString::to_string)
                            .ok_or_else(|| SnippetError::Run(format!("unknown variable {name}")))
                    })
                }
            })
            .build();
        let _ = shared.executor_class.set(executor_class);

        let agent_class_cell = Arc::new(OnceLock::new());
        let agent_class = runtime
            .define_class(AGENT_CLASS)
            .static_method(TRAP_METHOD, |_ctx, _args| Ok(Value::None))
            .static_method(LOOP_METHOD, {
                let agent_class = agent_class_cell.clone();
                move |ctx, _args| loop_waiting_for_attach(ctx, agent_class.get().copied())
            })
            .static_method(ENTRY_METHOD, {
                let shared = shared.clone();
                move |ctx, args| shared.main0(ctx, args)
            })
            .build();
        let _ = agent_class_cell.set(agent_class);

        let loop_method = runtime.method_id(agent_class, LOOP_METHOD).ok_or_else(|| {
            io::Error::other(format!("{AGENT_CLASS}.{LOOP_METHOD} is not defined"))
        })?;
        let reserved_thread = runtime.spawn_thread(
            format!("{RESERVED_THREAD_TAG}-listener"),
            move |ctx| ctx.call(loop_method, None, vec![]).map(drop),
        )?;
        info!(target: "teleshell::agent", "agent installed, reserved thread is {reserved_thread}");

        Ok(Self {
            agent_class,
            executor_class,
            reserved_thread,
        })
    }

    pub fn agent_class(&self) -> ClassId {
        self.agent_class
    }

    pub fn executor_class(&self) -> ClassId {
        self.executor_class
    }

    pub fn reserved_thread(&self) -> ThreadId {
        self.reserved_thread
    }
}

fn text_argument(args: &[Value], method: &str) -> Result<String, Unwind> {
    args.first()
        .and_then(Value::as_text)
        .map(str::to_owned)
        .ok_or_else(|| Unwind::Error(format!("{method} takes a text argument")))
}

fn fault(e: ControlError) -> Unwind {
    match e {
        ControlError::Disconnected => Unwind::Exited,
        e => Unwind::Error(e.to_string()),
    }
}

/// Body of the reserved thread: hits the trap method twice per cycle, forever.
fn loop_waiting_for_attach(ctx: &ThreadContext, agent_class: Option<ClassId>) -> Result<Value, Unwind> {
    let trap = agent_class
        .and_then(|class| ctx.runtime().method_id(class, TRAP_METHOD))
        .ok_or_else(|| Unwind::Error(format!("{AGENT_CLASS}.{TRAP_METHOD} is not defined")))?;
    loop {
        ctx.call(trap, None, vec![])?;
        ctx.sleep(TRAP_PERIOD)?;
    }
}

impl Shared {
    /// Entry point: starts a worker dialing back to `host:port` and returns at once.
    fn main0(self: &Arc<Self>, ctx: &ThreadContext, args: Vec<Value>) -> Result<Value, Unwind> {
        let argument: HandshakeArgument = text_argument(&args, ENTRY_METHOD)?
            .parse()
            .map_err(|e: crate::contract::MalformedHandshake| Unwind::Error(e.to_string()))?;

        let n = self.workers.fetch_add(1, Ordering::Relaxed) + 1;
        let shared = self.clone();
        ctx.runtime()
            .spawn_thread(format!("teleshell-agent-{n}"), move |ctx| {
                shared.serve(ctx, &argument)
            })
            .map_err(|e| Unwind::Error(format!("cannot start the agent worker: {e}")))?;
        Ok(Value::None)
    }

    /// Body of a worker: dial back, then execute requests until the controller goes away.
    fn serve(&self, ctx: &ThreadContext, argument: &HandshakeArgument) -> Result<(), Unwind> {
        let stream = match channel::connect(argument, DEFAULT_TIMEOUT) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target: "teleshell::agent", "cannot connect back to {argument}: {e}");
                return Ok(());
            }
        };
        let (streams, jobs) = match serve_agent(stream) {
            Ok(served) => served,
            Err(e) => {
                warn!(target: "teleshell::agent", "cannot serve the controller: {e}");
                return Ok(());
            }
        };
        info!(target: "teleshell::agent", "connected back to {argument}");

        let runtime = ctx.runtime();
        let executor_class = *self
            .executor_class
            .get()
            .ok_or_else(|| Unwind::Error("executor class is not defined".to_owned()))?;
        let stop_exception = runtime.new_object(self.stop_class, Vec::new()).map_err(fault)?;
        let executor = runtime
            .new_object(executor_class, StopState::idle(stop_exception).fields())
            .map_err(fault)?;
        lock(&self.executors).insert(
            executor,
            Arc::new(Executor {
                streams: streams.clone(),
                interpreter: Mutex::new(Interpreter::new()),
                pending_input: Mutex::new(Vec::new()),
            }),
        );

        let result = match (
            runtime.method_id(executor_class, INVOKE_METHOD),
            runtime.method_id(executor_class, VAR_VALUE_METHOD),
        ) {
            (Some(invoke), Some(var_value)) => {
                execute_jobs(ctx, &jobs, executor, stop_exception, invoke, var_value)
            }
            _ => Err(Unwind::Error("executor methods are not defined".to_owned())),
        };

        lock(&self.executors).remove(&executor);
        runtime.drop_object(executor);
        runtime.drop_object(stop_exception);
        streams.close();
        info!(target: "teleshell::agent", "controller {argument} went away");
        result
    }

    /// Runs user code inside a frame of the executor, maintaining its stop state.
    fn run_user_code<F>(&self, ctx: &ThreadContext, this: ObjectId, f: F) -> Result<Value, Unwind>
    where
        F: FnOnce(&Executor, &mut dyn Host) -> Result<String, SnippetError>,
    {
        let executor = lock(&self.executors)
            .get(&this)
            .cloned()
            .ok_or_else(|| Unwind::Error(format!("{this} is not a live executor")))?;
        let runtime = ctx.runtime();

        runtime
            .set_field(this, StopState::EXPECTING_STOP, Value::Bool(false))
            .map_err(fault)?;
        runtime
            .set_field(this, StopState::IN_CLIENT_CODE, Value::Bool(true))
            .map_err(fault)?;

        let result = {
            let mut host = AgentHost {
                ctx,
                executor: &executor,
            };
            f(&executor, &mut host)
        };

        leave_user_code(ctx, this)?;

        match result {
            Ok(value) => Ok(Value::Text(value)),
            Err(SnippetError::Interrupted(unwind)) => Err(unwind),
            Err(e) => Err(Unwind::Error(e.to_string())),
        }
    }
}

/// Leaves user code, waiting for a stop in progress to complete.
fn leave_user_code(ctx: &ThreadContext, this: ObjectId) -> Result<(), Unwind> {
    let runtime = ctx.runtime();
    runtime
        .set_field(this, StopState::IN_CLIENT_CODE, Value::Bool(false))
        .map_err(fault)?;
    while runtime
        .get_field(this, StopState::EXPECTING_STOP)
        .map_err(fault)?
        .as_bool()
        .unwrap_or(false)
    {
        match ctx.sleep(STOP_POLL) {
            Ok(()) | Err(Unwind::Exception(_)) => {}
            Err(unwind) => return Err(unwind),
        }
    }
    if let Some(exception) = ctx.clear_pending_unwind() {
        debug!(target: "teleshell::agent", "discarded late unwind with {exception}");
    }
    Ok(())
}

fn execute_jobs(
    ctx: &ThreadContext,
    jobs: &Receiver<Job>,
    executor: ObjectId,
    stop_exception: ObjectId,
    invoke: MethodId,
    var_value: MethodId,
) -> Result<(), Unwind> {
    loop {
        match ctx.safepoint() {
            Ok(()) | Err(Unwind::Exception(_)) => {}
            Err(unwind) => return Err(unwind),
        }

        let job = match jobs.recv_timeout(JOB_POLL) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        };

        ctx.clear_pending_unwind();
        let (method, argument) = match &job.request {
            Request::Invoke(snippet) => (invoke, snippet.clone()),
            Request::VarValue(name) => (var_value, name.clone()),
        };
        let outcome = match ctx.call(method, Some(executor), vec![Value::Text(argument)]) {
            Ok(Value::Text(value)) => Outcome::Value(value),
            Ok(value) => Outcome::Value(value.to_string()),
            Err(Unwind::Exception(exception)) if exception == stop_exception => Outcome::Stopped,
            Err(Unwind::Exception(exception)) => {
                Outcome::RunError(format!("uncaught exception {exception}"))
            }
            Err(Unwind::Error(message)) => Outcome::RunError(message),
            Err(Unwind::Exited) => {
                job.respond(Outcome::Internal("the target is exiting".to_owned()));
                return Err(Unwind::Exited);
            }
        };
        debug!(target: "teleshell::agent", "{:?} gave {outcome:?}", job.request);
        job.respond(outcome);
    }
}

/// Snippet host backed by the executor thread and the controller's streams.
struct AgentHost<'a> {
    ctx: &'a ThreadContext,
    executor: &'a Executor,
}

impl Host for AgentHost<'_> {
    fn safepoint(&mut self) -> Result<(), Unwind> {
        self.ctx.safepoint()
    }

    fn sleep(&mut self, duration: Duration) -> Result<(), Unwind> {
        self.ctx.sleep(duration)
    }

    fn write(&mut self, stream: &str, text: &str) -> Result<(), String> {
        self.executor
            .streams
            .write(stream, text.as_bytes())
            .map_err(|e| e.to_string())
    }

    fn read_line(&mut self) -> Result<Option<String>, String> {
        let mut pending = lock(&self.executor.pending_input);
        loop {
            if let Some(end) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=end).collect();
                let line = String::from_utf8_lossy(&line[..end]);
                return Ok(Some(line.trim_end_matches('\r').to_owned()));
            }
            let data = self
                .executor
                .streams
                .read(IN, 256)
                .map_err(|e| e.to_string())?;
            if data.is_empty() {
                if pending.is_empty() {
                    return Ok(None);
                }
                let line = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                return Ok(Some(line));
            }
            pending.extend_from_slice(&data);
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::control::Event;

    #[test]
    fn test_install_defines_the_contract() {
        let rt = Runtime::new();
        let agent = Agent::install(&rt).unwrap();

        let threads = rt.all_threads().unwrap();
        assert!(threads
            .iter()
            .any(|t| t.id == agent.reserved_thread() && t.name.starts_with(RESERVED_THREAD_TAG)));
        assert_eq!(rt.classes_by_name(AGENT_CLASS).unwrap().len(), 1);
        assert_eq!(rt.classes_by_name(DEFAULT_EXECUTOR_TYPE).unwrap().len(), 1);
        assert_eq!(rt.classes_by_name(STOP_EXCEPTION_TYPE).unwrap().len(), 1);
        for method in [TRAP_METHOD, LOOP_METHOD, ENTRY_METHOD] {
            assert!(rt.method_id(agent.agent_class(), method).is_some());
        }
        rt.exit("test over");
    }

    #[test]
    fn test_reserved_thread_hits_the_trap() {
        let rt = Runtime::new();
        let agent = Agent::install(&rt).unwrap();
        let trap = rt
            .methods_by_name(agent.agent_class(), TRAP_METHOD)
            .unwrap()
            .remove(0);
        rt.create_breakpoint(&trap.location, Some(agent.reserved_thread()))
            .unwrap();

        let events = rt.remove_event(Duration::from_secs(5)).unwrap().unwrap();
        assert_matches!(
            events.as_slice(),
            [Event::Breakpoint { thread, .. }] if *thread == agent.reserved_thread()
        );

        let entry = rt.method_id(agent.agent_class(), ENTRY_METHOD).unwrap();
        assert_matches!(
            rt.invoke_method(
                agent.reserved_thread(),
                agent.agent_class(),
                entry,
                vec![Value::Text("no port".to_owned())]
            ),
            Err(ControlError::Invocation(message)) if message.contains("malformed")
        );

        rt.delete_all_breakpoints().unwrap();
        rt.resume().unwrap();
        rt.exit("test over");
    }
}
