//! Scripted process-control double recording every call.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use crate::{
    control::{
        ClassId, ClassRef, ControlError, Event, EventSet, Location, MethodId, MethodRef,
        ObjectId, RequestId, StackFrame, ThreadId, ThreadRef, Value, VirtualMachine,
    },
    internal::lock,
};

#[derive(Default)]
pub struct ScriptedVm {
    calls: Mutex<Vec<String>>,
    threads: Vec<ThreadRef>,
    classes: Vec<ClassRef>,
    methods: BTreeMap<(ClassId, String), MethodRef>,
    frames: BTreeMap<ThreadId, Vec<StackFrame>>,
    fields: Mutex<BTreeMap<(ObjectId, String), Value>>,
    events: Mutex<VecDeque<EventSet>>,
    failures: BTreeMap<&'static str, ControlError>,
    invocation_result: Option<Result<Value, ControlError>>,
    suspend_count: Mutex<i64>,
}

impl ScriptedVm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread(mut self, id: u64, name: &str) -> Self {
        self.threads.push(ThreadRef {
            id: ThreadId(id),
            name: name.to_owned(),
        });
        self
    }

    pub fn class(mut self, id: u64, name: &str, methods: &[(u64, &str)]) -> Self {
        let class = ClassId(id);
        self.classes.push(ClassRef {
            id: class,
            name: name.to_owned(),
        });
        for (line, (method, method_name)) in methods.iter().enumerate() {
            self.methods.insert(
                (class, (*method_name).to_owned()),
                MethodRef {
                    id: MethodId(*method),
                    name: (*method_name).to_owned(),
                    location: Location {
                        class,
                        method: MethodId(*method),
                        line: line as u32 + 1,
                    },
                },
            );
        }
        self
    }

    /// Frames of `thread`, top first, as `(declaring type, method, receiver)`.
    pub fn stack(mut self, thread: u64, frames: &[(&str, &str, Option<u64>)]) -> Self {
        self.frames.insert(
            ThreadId(thread),
            frames
                .iter()
                .map(|(declaring_type, method, this)| StackFrame {
                    location: Location {
                        class: ClassId(0),
                        method: MethodId(0),
                        line: 0,
                    },
                    declaring_type: (*declaring_type).to_owned(),
                    method: (*method).to_owned(),
                    this: this.map(ObjectId),
                })
                .collect(),
        );
        self
    }

    pub fn field(self, object: u64, name: &str, value: Value) -> Self {
        lock(&self.fields).insert((ObjectId(object), name.to_owned()), value);
        self
    }

    pub fn event(self, events: EventSet) -> Self {
        lock(&self.events).push_back(events);
        self
    }

    /// Makes every call of the named operation fail.
    pub fn failing(mut self, operation: &'static str, error: ControlError) -> Self {
        self.failures.insert(operation, error);
        self
    }

    pub fn invocation_result(mut self, result: Result<Value, ControlError>) -> Self {
        self.invocation_result = Some(result);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn suspend_count(&self) -> i64 {
        *lock(&self.suspend_count)
    }

    pub fn field_value(&self, object: u64, name: &str) -> Option<Value> {
        lock(&self.fields)
            .get(&(ObjectId(object), name.to_owned()))
            .cloned()
    }

    fn record(&self, operation: &'static str, detail: String) -> Result<(), ControlError> {
        let call = if detail.is_empty() {
            operation.to_owned()
        } else {
            format!("{operation} {detail}")
        };
        lock(&self.calls).push(call);
        match self.failures.get(operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

impl VirtualMachine for ScriptedVm {
    fn all_threads(&self) -> Result<Vec<ThreadRef>, ControlError> {
        self.record("all_threads", String::new())?;
        Ok(self.threads.clone())
    }

    fn classes_by_name(&self, name: &str) -> Result<Vec<ClassRef>, ControlError> {
        self.record("classes_by_name", name.to_owned())?;
        Ok(self
            .classes
            .iter()
            .filter(|c| c.name == name)
            .cloned()
            .collect())
    }

    fn methods_by_name(&self, class: ClassId, name: &str) -> Result<Vec<MethodRef>, ControlError> {
        self.record("methods_by_name", format!("{class} {name}"))?;
        Ok(self
            .methods
            .get(&(class, name.to_owned()))
            .cloned()
            .into_iter()
            .collect())
    }

    fn create_breakpoint(
        &self,
        location: &Location,
        thread: Option<ThreadId>,
    ) -> Result<RequestId, ControlError> {
        let filter = thread.map_or_else(|| "any thread".to_owned(), |t| t.to_string());
        self.record("create_breakpoint", format!("{location} {filter}"))?;
        Ok(RequestId(location.method.0))
    }

    fn delete_all_breakpoints(&self) -> Result<(), ControlError> {
        self.record("delete_all_breakpoints", String::new())
    }

    fn remove_event(&self, timeout: Duration) -> Result<Option<EventSet>, ControlError> {
        self.record("remove_event", String::new())?;
        let events = lock(&self.events).pop_front();
        if let Some(events) = &events {
            if events
                .iter()
                .any(|e| matches!(e, Event::Breakpoint { .. }))
            {
                *lock(&self.suspend_count) += 1;
            }
        } else {
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
        }
        Ok(events)
    }

    fn suspend(&self) -> Result<(), ControlError> {
        self.record("suspend", String::new())?;
        *lock(&self.suspend_count) += 1;
        Ok(())
    }

    fn resume(&self) -> Result<(), ControlError> {
        self.record("resume", String::new())?;
        *lock(&self.suspend_count) -= 1;
        Ok(())
    }

    fn invoke_method(
        &self,
        thread: ThreadId,
        class: ClassId,
        method: MethodId,
        args: Vec<Value>,
    ) -> Result<Value, ControlError> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        self.record(
            "invoke_method",
            format!("{thread} {class} {method} ({})", args.join(", ")),
        )?;
        self.invocation_result.clone().unwrap_or(Ok(Value::None))
    }

    fn frames(&self, thread: ThreadId) -> Result<Vec<StackFrame>, ControlError> {
        self.record("frames", thread.to_string())?;
        Ok(self.frames.get(&thread).cloned().unwrap_or_default())
    }

    fn get_field(&self, object: ObjectId, field: &str) -> Result<Value, ControlError> {
        self.record("get_field", format!("{object} {field}"))?;
        lock(&self.fields)
            .get(&(object, field.to_owned()))
            .cloned()
            .ok_or_else(|| ControlError::NoSuchField(field.to_owned()))
    }

    fn set_field(&self, object: ObjectId, field: &str, value: Value) -> Result<(), ControlError> {
        self.record("set_field", format!("{object} {field}={value}"))?;
        lock(&self.fields).insert((object, field.to_owned()), value);
        Ok(())
    }

    fn stop_thread(&self, thread: ThreadId, exception: ObjectId) -> Result<(), ControlError> {
        self.record("stop_thread", format!("{thread} {exception}"))
    }

    fn dispose(&self) -> Result<(), ControlError> {
        self.record("dispose", String::new())
    }
}
