//! Managed runtime hosting the target side.
//!
//! Threads spawned through [`Runtime::spawn_thread`] are *managed*: they run methods of classes
//! defined in the runtime through [`ThreadContext::call`], and they honor process control at
//! safepoints (method entries, [`ThreadContext::safepoint`] and [`ThreadContext::sleep`]). This
//! is what lets the runtime implement [`VirtualMachine`] cooperatively:
//!
//! * whole-process suspension is a counter, managed threads park at their next safepoint while it
//!   is non zero
//! * traps are method-entry breakpoints; a hit queues an event and suspends the whole process
//! * a thread paused by an event executes the forced invocations queued for it
//! * a forced unwind is delivered at the next safepoint as [`Unwind::Exception`]
//!
//! Each controller works through its own [`Attachment`]. Attaching supersedes the previous
//! controller: its event waits end, and its dispose no longer touches the runtime.
//!
//! A runtime is reached either in process ([`crate::attach::connector::local`]) or through its
//! debug port ([`debug_server`]).

pub mod debug_server;
mod thread;

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    mem::discriminant,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use log::{debug, warn};

pub use thread::{ThreadContext, Unwind};

use crate::{
    control::{
        ClassId, ClassRef, ControlError, Event, EventSet, Location, MethodId, MethodRef, ObjectId,
        RequestId, StackFrame, ThreadId, ThreadRef, Value, VirtualMachine,
    },
    internal::lock,
};

/// Body of a method. Receives the receiver for instance methods.
pub type MethodBody =
    Arc<dyn Fn(&ThreadContext, Option<ObjectId>, Vec<Value>) -> Result<Value, Unwind> + Send + Sync>;

/// Handle on a managed runtime. Clones share the same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    /// Signaled on suspension changes, queued invocations and forced unwinds.
    changed: Condvar,
    /// Signaled when an event set is queued or the runtime exits.
    events_ready: Condvar,
    next_id: AtomicU64,
}

#[derive(Default)]
struct State {
    suspend_count: u32,
    threads: BTreeMap<ThreadId, ThreadState>,
    classes: BTreeMap<ClassId, Class>,
    method_owners: HashMap<MethodId, ClassId>,
    objects: HashMap<ObjectId, Object>,
    breakpoints: BTreeMap<RequestId, Breakpoint>,
    events: VecDeque<EventSet>,
    exited: Option<String>,
    /// Bumped on every attach and dispose; identifies the current controller.
    generation: u64,
}

struct ThreadState {
    name: String,
    frames: Vec<Frame>,
    event_paused: bool,
    invoking: u32,
    invocations: VecDeque<Invocation>,
    pending_unwind: Option<ObjectId>,
}

struct Frame {
    location: Location,
    this: Option<ObjectId>,
}

struct Class {
    name: String,
    methods: Vec<Method>,
}

struct Method {
    id: MethodId,
    name: String,
    is_static: bool,
    line: u32,
    body: MethodBody,
}

struct Object {
    class: ClassId,
    fields: BTreeMap<String, Value>,
}

struct Breakpoint {
    location: Location,
    thread: Option<ThreadId>,
}

struct Invocation {
    method: MethodId,
    args: Vec<Value>,
    reply: mpsc::Sender<Result<Value, ControlError>>,
}

impl State {
    fn method(&self, id: MethodId) -> Option<(ClassId, &Class, &Method)> {
        let class_id = *self.method_owners.get(&id)?;
        let class = self.classes.get(&class_id)?;
        let method = class.methods.iter().find(|m| m.id == id)?;
        Some((class_id, class, method))
    }

    fn alive(&self) -> Result<(), ControlError> {
        match self.exited {
            Some(_) => Err(ControlError::Disconnected),
            None => Ok(()),
        }
    }

    fn thread_mut(&mut self, id: ThreadId) -> Result<&mut ThreadState, ControlError> {
        self.threads
            .get_mut(&id)
            .ok_or_else(|| ControlError::InvalidArgument(format!("unknown {id}")))
    }

    fn object_mut(&mut self, id: ObjectId) -> Result<&mut Object, ControlError> {
        self.objects
            .get_mut(&id)
            .ok_or_else(|| ControlError::InvalidArgument(format!("unknown {id}")))
    }
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn wait<'a>(&self, state: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.changed
            .wait(state)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changed: Condvar::new(),
                events_ready: Condvar::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Starts defining a class. Defining the same name twice loads a second instance of it.
    pub fn define_class(&self, name: impl Into<String>) -> ClassBuilder<'_> {
        ClassBuilder {
            runtime: self,
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Finds a method of `class` by name.
    pub fn method_id(&self, class: ClassId, name: &str) -> Option<MethodId> {
        let state = self.inner.lock();
        let class = state.classes.get(&class)?;
        class.methods.iter().find(|m| m.name == name).map(|m| m.id)
    }

    /// Starts a controller session, superseding the previous one.
    pub fn attach(&self) -> Attachment {
        let mut state = self.inner.lock();
        state.generation += 1;
        self.inner.events_ready.notify_all();
        Attachment {
            runtime: self.clone(),
            generation: state.generation,
        }
    }

    /// Allocates an object of `class` with the given fields.
    pub fn new_object(
        &self,
        class: ClassId,
        fields: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<ObjectId, ControlError> {
        let mut state = self.inner.lock();
        if !state.classes.contains_key(&class) {
            return Err(ControlError::InvalidArgument(format!("unknown {class}")));
        }
        let id = ObjectId(self.inner.next_id());
        state.objects.insert(
            id,
            Object {
                class,
                fields: fields.into_iter().collect(),
            },
        );
        Ok(id)
    }

    /// Releases an object. Returns whether it was allocated.
    pub fn drop_object(&self, object: ObjectId) -> bool {
        self.inner.lock().objects.remove(&object).is_some()
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().objects.len()
    }

    /// Name of the class of `object`.
    pub fn class_name_of(&self, object: ObjectId) -> Option<String> {
        let state = self.inner.lock();
        let class = state.objects.get(&object)?.class;
        state.classes.get(&class).map(|c| c.name.clone())
    }

    /// Spawns a managed thread running `body`.
    ///
    /// The thread is visible to process control until `body` returns.
    pub fn spawn_thread<F>(&self, name: impl Into<String>, body: F) -> std::io::Result<ThreadId>
    where
        F: FnOnce(&ThreadContext) -> Result<(), Unwind> + Send + 'static,
    {
        let name = name.into();
        let id = ThreadId(self.inner.next_id());
        self.inner.lock().threads.insert(
            id,
            ThreadState {
                name: name.clone(),
                frames: Vec::new(),
                event_paused: false,
                invoking: 0,
                invocations: VecDeque::new(),
                pending_unwind: None,
            },
        );

        let ctx = ThreadContext::new(self.clone(), id);
        let spawned = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _registration = Registration(&ctx);
                match body(&ctx) {
                    Ok(()) => {}
                    Err(Unwind::Exited) => {
                        debug!(target: "teleshell::runtime", "thread {name} stopped, runtime exited")
                    }
                    Err(unwind) => {
                        warn!(target: "teleshell::runtime", "thread {name} ended with {unwind}")
                    }
                }
            });

        if let Err(e) = spawned {
            self.inner.lock().threads.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Marks the runtime as exited and reports it to the attached controller.
    ///
    /// Managed threads unwind with [`Unwind::Exited`] at their next safepoint.
    pub fn exit(&self, description: impl Into<String>) {
        let mut state = self.inner.lock();
        if state.exited.is_some() {
            return;
        }
        let description = description.into();
        debug!(target: "teleshell::runtime", "exiting: {description}");
        state.events.push_back(vec![Event::VmDeath(description.clone())]);
        state.exited = Some(description);
        self.inner.events_ready.notify_all();
        self.inner.changed.notify_all();
    }

    pub fn is_exited(&self) -> bool {
        self.inner.lock().exited.is_some()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Unregisters a managed thread when its body returns or panics.
struct Registration<'a>(&'a ThreadContext);

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let inner = &self.0.runtime().inner;
        inner.lock().threads.remove(&self.0.id());
        inner.changed.notify_all();
    }
}

/// Defines a class, see [`Runtime::define_class`].
pub struct ClassBuilder<'a> {
    runtime: &'a Runtime,
    name: String,
    methods: Vec<(String, bool, MethodBody)>,
}

impl ClassBuilder<'_> {
    pub fn static_method<F>(mut self, name: &str, body: F) -> Self
    where
        F: Fn(&ThreadContext, Vec<Value>) -> Result<Value, Unwind> + Send + Sync + 'static,
    {
        let body: MethodBody =
            Arc::new(move |ctx: &ThreadContext, _this: Option<ObjectId>, args: Vec<Value>| {
                body(ctx, args)
            });
        self.methods.push((name.to_owned(), true, body));
        self
    }

    pub fn method<F>(mut self, name: &str, body: F) -> Self
    where
        F: Fn(&ThreadContext, ObjectId, Vec<Value>) -> Result<Value, Unwind> + Send + Sync + 'static,
    {
        let method_name = name.to_owned();
        let body: MethodBody =
            Arc::new(move |ctx: &ThreadContext, this: Option<ObjectId>, args: Vec<Value>| {
                match this {
                    Some(this) => body(ctx, this, args),
                    None => Err(Unwind::Error(format!("{method_name} needs a receiver"))),
                }
            });
        self.methods.push((name.to_owned(), false, body));
        self
    }

    pub fn build(self) -> ClassId {
        let inner = &self.runtime.inner;
        let class_id = ClassId(inner.next_id());
        let methods: Vec<Method> = self
            .methods
            .into_iter()
            .enumerate()
            .map(|(index, (name, is_static, body))| Method {
                id: MethodId(inner.next_id()),
                name,
                is_static,
                line: index as u32 + 1,
                body,
            })
            .collect();

        let mut state = inner.lock();
        for method in &methods {
            state.method_owners.insert(method.id, class_id);
        }
        state.classes.insert(
            class_id,
            Class {
                name: self.name,
                methods,
            },
        );
        class_id
    }
}

impl VirtualMachine for Runtime {
    fn all_threads(&self) -> Result<Vec<ThreadRef>, ControlError> {
        let state = self.inner.lock();
        state.alive()?;
        Ok(state
            .threads
            .iter()
            .map(|(id, t)| ThreadRef {
                id: *id,
                name: t.name.clone(),
            })
            .collect())
    }

    fn classes_by_name(&self, name: &str) -> Result<Vec<ClassRef>, ControlError> {
        let state = self.inner.lock();
        state.alive()?;
        Ok(state
            .classes
            .iter()
            .filter(|(_, c)| c.name == name)
            .map(|(id, c)| ClassRef {
                id: *id,
                name: c.name.clone(),
            })
            .collect())
    }

    fn methods_by_name(&self, class: ClassId, name: &str) -> Result<Vec<MethodRef>, ControlError> {
        let state = self.inner.lock();
        state.alive()?;
        let c = state
            .classes
            .get(&class)
            .ok_or_else(|| ControlError::InvalidArgument(format!("unknown {class}")))?;
        Ok(c.methods
            .iter()
            .filter(|m| m.name == name)
            .map(|m| MethodRef {
                id: m.id,
                name: m.name.clone(),
                location: Location {
                    class,
                    method: m.id,
                    line: m.line,
                },
            })
            .collect())
    }

    fn create_breakpoint(
        &self,
        location: &Location,
        thread: Option<ThreadId>,
    ) -> Result<RequestId, ControlError> {
        let mut state = self.inner.lock();
        state.alive()?;
        match state.method(location.method) {
            Some((class, _, _)) if class == location.class => {}
            _ => {
                return Err(ControlError::InvalidArgument(format!(
                    "no method at {location}"
                )))
            }
        }
        let request = RequestId(self.inner.next_id());
        state.breakpoints.insert(
            request,
            Breakpoint {
                location: *location,
                thread,
            },
        );
        Ok(request)
    }

    fn delete_all_breakpoints(&self) -> Result<(), ControlError> {
        let mut state = self.inner.lock();
        state.alive()?;
        state.breakpoints.clear();
        Ok(())
    }

    fn remove_event(&self, timeout: Duration) -> Result<Option<EventSet>, ControlError> {
        self.take_events(None, timeout)
    }

    fn suspend(&self) -> Result<(), ControlError> {
        let mut state = self.inner.lock();
        state.alive()?;
        state.suspend_count += 1;
        Ok(())
    }

    fn resume(&self) -> Result<(), ControlError> {
        let mut state = self.inner.lock();
        state.alive()?;
        state.suspend_count = state.suspend_count.saturating_sub(1);
        if state.suspend_count == 0 {
            for t in state.threads.values_mut() {
                t.event_paused = false;
            }
            self.inner.changed.notify_all();
        }
        Ok(())
    }

    fn invoke_method(
        &self,
        thread: ThreadId,
        class: ClassId,
        method: MethodId,
        args: Vec<Value>,
    ) -> Result<Value, ControlError> {
        let (reply, result) = mpsc::channel();
        {
            let mut state = self.inner.lock();
            state.alive()?;
            match state.method(method) {
                Some((owner, _, m)) if owner == class && m.is_static => {}
                Some((owner, _, m)) if owner == class => {
                    return Err(ControlError::InvalidArgument(format!(
                        "{} is not static",
                        m.name
                    )))
                }
                _ => {
                    return Err(ControlError::InvalidArgument(format!(
                        "{method} does not belong to {class}"
                    )))
                }
            }
            let paused = state.suspend_count > 0;
            let t = state.thread_mut(thread)?;
            if !(paused && t.event_paused) {
                return Err(ControlError::IncompatibleThreadState(format!(
                    "{thread} is not paused by an event"
                )));
            }
            t.invocations.push_back(Invocation {
                method,
                args,
                reply,
            });
            self.inner.changed.notify_all();
        }
        result.recv().map_err(|_| {
            ControlError::Invocation(format!("{thread} ended before completing the invocation"))
        })?
    }

    fn frames(&self, thread: ThreadId) -> Result<Vec<StackFrame>, ControlError> {
        let mut state = self.inner.lock();
        state.alive()?;
        let suspended = state.suspend_count > 0;
        let t = state.thread_mut(thread)?;
        if !suspended && !t.event_paused {
            return Err(ControlError::IncompatibleThreadState(format!(
                "{thread} is not suspended"
            )));
        }
        let locations: Vec<(Location, Option<ObjectId>)> =
            t.frames.iter().rev().map(|f| (f.location, f.this)).collect();
        Ok(locations
            .into_iter()
            .filter_map(|(location, this)| {
                let (_, class, method) = state.method(location.method)?;
                Some(StackFrame {
                    location,
                    declaring_type: class.name.clone(),
                    method: method.name.clone(),
                    this,
                })
            })
            .collect())
    }

    fn get_field(&self, object: ObjectId, field: &str) -> Result<Value, ControlError> {
        let mut state = self.inner.lock();
        state
            .object_mut(object)?
            .fields
            .get(field)
            .cloned()
            .ok_or_else(|| ControlError::NoSuchField(field.to_owned()))
    }

    fn set_field(&self, object: ObjectId, field: &str, value: Value) -> Result<(), ControlError> {
        let mut state = self.inner.lock();
        let slot = state
            .object_mut(object)?
            .fields
            .get_mut(field)
            .ok_or_else(|| ControlError::NoSuchField(field.to_owned()))?;
        if *slot != Value::None && discriminant(slot) != discriminant(&value) {
            return Err(ControlError::InvalidType(format!(
                "{field} holds a {}, got a {}",
                slot.type_name(),
                value.type_name()
            )));
        }
        *slot = value;
        Ok(())
    }

    fn stop_thread(&self, thread: ThreadId, exception: ObjectId) -> Result<(), ControlError> {
        let mut state = self.inner.lock();
        state.alive()?;
        if !state.objects.contains_key(&exception) {
            return Err(ControlError::InvalidArgument(format!("unknown {exception}")));
        }
        state.thread_mut(thread)?.pending_unwind = Some(exception);
        self.inner.changed.notify_all();
        Ok(())
    }

    fn dispose(&self) -> Result<(), ControlError> {
        self.release(None);
        Ok(())
    }
}

impl Runtime {
    /// Pops the next event set. With a `generation`, fails once that controller is superseded.
    fn take_events(
        &self,
        generation: Option<u64>,
        timeout: Duration,
    ) -> Result<Option<EventSet>, ControlError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        loop {
            if generation.is_some_and(|g| g != state.generation) {
                return Err(ControlError::Disconnected);
            }
            if let Some(events) = state.events.pop_front() {
                return Ok(Some(events));
            }
            state.alive()?;
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            state = self
                .inner
                .events_ready
                .wait_timeout(state, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Drops whatever a controller left behind. With a `generation`, only while that controller
    /// is the current one.
    fn release(&self, generation: Option<u64>) {
        let mut state = self.inner.lock();
        if generation.is_some_and(|g| g != state.generation) {
            return;
        }
        state.generation += 1;
        state.breakpoints.clear();
        state.events.clear();
        state.suspend_count = 0;
        for t in state.threads.values_mut() {
            t.event_paused = false;
            for invocation in t.invocations.drain(..) {
                let _ = invocation.reply.send(Err(ControlError::Disconnected));
            }
        }
        self.inner.changed.notify_all();
        self.inner.events_ready.notify_all();
        debug!(target: "teleshell::runtime", "controller detached");
    }
}

/// A controller session on a [`Runtime`], see [`Runtime::attach`].
#[derive(Clone)]
pub struct Attachment {
    runtime: Runtime,
    generation: u64,
}

impl Attachment {
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Whether no later controller superseded this one and it was not disposed.
    pub fn is_current(&self) -> bool {
        self.runtime.inner.lock().generation == self.generation
    }
}

impl VirtualMachine for Attachment {
    fn all_threads(&self) -> Result<Vec<ThreadRef>, ControlError> {
        self.runtime.all_threads()
    }

    fn classes_by_name(&self, name: &str) -> Result<Vec<ClassRef>, ControlError> {
        self.runtime.classes_by_name(name)
    }

    fn methods_by_name(&self, class: ClassId, name: &str) -> Result<Vec<MethodRef>, ControlError> {
        self.runtime.methods_by_name(class, name)
    }

    fn create_breakpoint(
        &self,
        location: &Location,
        thread: Option<ThreadId>,
    ) -> Result<RequestId, ControlError> {
        self.runtime.create_breakpoint(location, thread)
    }

    fn delete_all_breakpoints(&self) -> Result<(), ControlError> {
        self.runtime.delete_all_breakpoints()
    }

    fn remove_event(&self, timeout: Duration) -> Result<Option<EventSet>, ControlError> {
        self.runtime.take_events(Some(self.generation), timeout)
    }

    fn suspend(&self) -> Result<(), ControlError> {
        self.runtime.suspend()
    }

    fn resume(&self) -> Result<(), ControlError> {
        self.runtime.resume()
    }

    fn invoke_method(
        &self,
        thread: ThreadId,
        class: ClassId,
        method: MethodId,
        args: Vec<Value>,
    ) -> Result<Value, ControlError> {
        self.runtime.invoke_method(thread, class, method, args)
    }

    fn frames(&self, thread: ThreadId) -> Result<Vec<StackFrame>, ControlError> {
        self.runtime.frames(thread)
    }

    fn get_field(&self, object: ObjectId, field: &str) -> Result<Value, ControlError> {
        self.runtime.get_field(object, field)
    }

    fn set_field(&self, object: ObjectId, field: &str, value: Value) -> Result<(), ControlError> {
        self.runtime.set_field(object, field, value)
    }

    fn stop_thread(&self, thread: ThreadId, exception: ObjectId) -> Result<(), ControlError> {
        self.runtime.stop_thread(thread, exception)
    }

    fn dispose(&self) -> Result<(), ControlError> {
        self.runtime.release(Some(self.generation));
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::AtomicBool;

    use assert_matches::assert_matches;

    use super::*;

    fn wait_for_event(rt: &Runtime) -> EventSet {
        rt.remove_event(Duration::from_secs(5))
            .unwrap()
            .expect("event in time")
    }

    /// A class with a trap method called in a loop by a managed thread.
    fn looping_runtime() -> (Runtime, ClassId, MethodRef, ThreadId) {
        let rt = Runtime::new();
        let class = rt
            .define_class("test.Looper")
            .static_method("trap", |_ctx, _args| Ok(Value::None))
            .static_method("answer", |_ctx, args| {
                Ok(Value::Text(format!("got {}", args[0])))
            })
            .build();
        let trap = rt.methods_by_name(class, "trap").unwrap().remove(0);
        let trap_id = trap.id;
        let thread = rt
            .spawn_thread("looper", move |ctx| loop {
                ctx.call(trap_id, None, vec![])?;
                ctx.sleep(Duration::from_millis(5))?;
            })
            .unwrap();
        (rt, class, trap, thread)
    }

    #[test]
    fn test_breakpoint_suspends_and_invocation_runs_on_paused_thread() {
        let (rt, class, trap, thread) = looping_runtime();
        rt.create_breakpoint(&trap.location, Some(thread)).unwrap();

        let events = wait_for_event(&rt);
        assert_matches!(
            events.as_slice(),
            [Event::Breakpoint { thread: t, location, .. }] if *t == thread && *location == trap.location
        );

        let frames = rt.frames(thread).unwrap();
        assert_eq!(frames[0].method, "trap");
        assert_eq!(frames[0].declaring_type, "test.Looper");

        let answer = rt.methods_by_name(class, "answer").unwrap().remove(0);
        let result = rt
            .invoke_method(thread, class, answer.id, vec![Value::Int(42)])
            .unwrap();
        assert_eq!(result, Value::Text("got 42".to_owned()));

        rt.delete_all_breakpoints().unwrap();
        rt.resume().unwrap();
        assert_matches!(
            rt.frames(thread),
            Err(ControlError::IncompatibleThreadState(_))
        );
        rt.exit("test over");
    }

    #[test]
    fn test_thread_filter() {
        let (rt, _class, trap, _thread) = looping_runtime();
        rt.create_breakpoint(&trap.location, Some(ThreadId(u64::MAX)))
            .unwrap();
        assert_eq!(rt.remove_event(Duration::from_millis(100)).unwrap(), None);
        rt.exit("test over");
    }

    #[test]
    fn test_invoke_requires_event_pause() {
        let (rt, class, _trap, thread) = looping_runtime();
        let answer = rt.method_id(class, "answer").unwrap();
        rt.suspend().unwrap();
        assert_matches!(
            rt.invoke_method(thread, class, answer, vec![]),
            Err(ControlError::IncompatibleThreadState(_))
        );
        rt.resume().unwrap();
        rt.exit("test over");
    }

    #[test]
    fn test_forced_unwind() {
        let rt = Runtime::new();
        let class = rt.define_class("test.Sleeper").build();
        let exception = rt.new_object(class, Vec::new()).unwrap();
        let unwound = Arc::new(AtomicBool::new(false));
        let thread = rt
            .spawn_thread("sleeper", {
                let unwound = unwound.clone();
                move |ctx| {
                    let result = ctx.sleep(Duration::from_secs(30));
                    unwound.store(result == Err(Unwind::Exception(exception)), Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        rt.stop_thread(thread, exception).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !unwound.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(unwound.load(Ordering::SeqCst));
    }

    #[test]
    fn test_fields() {
        let rt = Runtime::new();
        let class = rt.define_class("test.Holder").build();
        let object = rt
            .new_object(class, [("flag".to_owned(), Value::Bool(false))])
            .unwrap();
        rt.set_field(object, "flag", Value::Bool(true)).unwrap();
        assert_eq!(rt.get_field(object, "flag").unwrap(), Value::Bool(true));
        assert_matches!(
            rt.set_field(object, "flag", Value::Int(1)),
            Err(ControlError::InvalidType(_))
        );
        assert_matches!(
            rt.get_field(object, "missing"),
            Err(ControlError::NoSuchField(_))
        );
        assert_eq!(rt.class_name_of(object).as_deref(), Some("test.Holder"));
    }

    #[test]
    fn test_suspend_count_and_dispose() {
        let (rt, _class, _trap, thread) = looping_runtime();
        rt.suspend().unwrap();
        rt.suspend().unwrap();
        rt.resume().unwrap();
        assert!(rt.frames(thread).is_ok());
        rt.dispose().unwrap();
        assert_matches!(
            rt.frames(thread),
            Err(ControlError::IncompatibleThreadState(_))
        );
        rt.resume().unwrap();
        rt.exit("test over");
    }

    #[test]
    fn test_exit_reports_death_then_disconnects() {
        let (rt, _class, _trap, _thread) = looping_runtime();
        rt.exit("bye");
        assert_eq!(wait_for_event(&rt), vec![Event::VmDeath("bye".to_owned())]);
        assert_matches!(
            rt.remove_event(Duration::from_millis(10)),
            Err(ControlError::Disconnected)
        );
        assert_matches!(rt.all_threads(), Err(ControlError::Disconnected));
    }

    #[test]
    fn test_classes_loaded_twice() {
        let rt = Runtime::new();
        rt.define_class("test.Twice").build();
        rt.define_class("test.Twice").build();
        assert_eq!(rt.classes_by_name("test.Twice").unwrap().len(), 2);
        assert!(rt.classes_by_name("test.Never").unwrap().is_empty());
    }

    #[test]
    fn test_superseded_attachment_leaves_events_alone() {
        let (rt, _class, trap, thread) = looping_runtime();
        let old = rt.attach();
        let waiting = std::thread::spawn({
            let old = old.clone();
            move || old.remove_event(Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(20));
        old.dispose().unwrap();
        assert_matches!(waiting.join().unwrap(), Err(ControlError::Disconnected));

        let new = rt.attach();
        // A late dispose of the previous controller is a no-op.
        old.dispose().unwrap();
        assert!(new.is_current());
        new.create_breakpoint(&trap.location, Some(thread)).unwrap();
        assert_matches!(
            old.remove_event(Duration::from_millis(10)),
            Err(ControlError::Disconnected)
        );
        let events = new
            .remove_event(Duration::from_secs(5))
            .unwrap()
            .expect("trap in time");
        assert_matches!(
            events.as_slice(),
            [Event::Breakpoint { thread: t, .. }] if *t == thread
        );

        new.dispose().unwrap();
        assert!(!new.is_current());
        assert_matches!(
            rt.frames(thread),
            Err(ControlError::IncompatibleThreadState(_))
        );
        rt.exit("test over");
    }

    #[test]
    fn test_drop_object() {
        let rt = Runtime::new();
        let class = rt.define_class("test.Dropped").build();
        let object = rt.new_object(class, Vec::new()).unwrap();
        assert_eq!(rt.object_count(), 1);
        assert!(rt.drop_object(object));
        assert!(!rt.drop_object(object));
        assert_eq!(rt.object_count(), 0);
        assert_matches!(
            rt.get_field(object, "any"),
            Err(ControlError::InvalidArgument(_))
        );
    }
}
