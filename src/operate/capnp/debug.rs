//! Debug wire: process control of a runtime over Cap'n Proto.
//!
//! [`DebuggeeServer`] is served by the target on its debug port. [`RemoteVm`] is the controller
//! side and implements [`VirtualMachine`] by shipping every operation to the connection thread.

use std::{future::Future, net::TcpStream, sync::mpsc, time::Duration};

use async_io::Async;
use capnp::Error;
use capnp_rpc::{rpc_twoparty_capnp::Side, RpcSystem};
use futures::{channel::oneshot, future::LocalBoxFuture, AsyncReadExt, FutureExt};
use log::{debug, warn};

use super::{
    bridge::RpcBridge,
    debug_capnp::{debuggee, event, frame},
    decode_error, encode_error, network, offload, read_location, read_value, write_location,
    write_value,
};
use crate::{
    control::{
        ClassId, ClassRef, ControlError, Event, EventSet, Location, MethodId, MethodRef, ObjectId,
        RequestId, StackFrame, ThreadId, ThreadRef, Value, VirtualMachine,
    },
    runtime::Attachment,
};

type EventReply = oneshot::Sender<Result<Option<EventSet>, ControlError>>;

/// Waits on the event queue from one thread per connection.
///
/// The thread ends with the connection, once its current wait is over.
struct EventWaiter {
    requests: mpsc::Sender<(Duration, EventReply)>,
}

impl EventWaiter {
    fn spawn(vm: Attachment) -> std::io::Result<Self> {
        let (requests, queue) = mpsc::channel::<(Duration, EventReply)>();
        std::thread::Builder::new()
            .name("teleshell-debug-wait".to_owned())
            .spawn(move || {
                for (timeout, reply) in queue {
                    let _ = reply.send(vm.remove_event(timeout));
                }
            })?;
        Ok(Self { requests })
    }

    async fn remove_event(
        &self,
        timeout: Duration,
    ) -> Result<Result<Option<EventSet>, ControlError>, Error> {
        let (reply, events) = oneshot::channel();
        self.requests
            .send((timeout, reply))
            .map_err(|_| Error::failed("event waiter is gone".to_owned()))?;
        events
            .await
            .map_err(|_| Error::failed("event waiter is gone".to_owned()))
    }
}

/// Serves process control of a runtime to one controller.
pub struct DebuggeeServer {
    vm: Attachment,
    waiter: EventWaiter,
}

impl DebuggeeServer {
    pub fn new(attachment: Attachment) -> std::io::Result<Self> {
        Ok(Self {
            waiter: EventWaiter::spawn(attachment.clone())?,
            vm: attachment,
        })
    }
}

impl debuggee::Server for DebuggeeServer {
    async fn all_threads(
        self: capnp::capability::Rc<Self>,
        _params: debuggee::AllThreadsParams,
        mut results: debuggee::AllThreadsResults,
    ) -> Result<(), Error> {
        let threads = self.vm.all_threads().map_err(encode_error)?;
        let mut list = results.get().init_threads(threads.len() as u32);
        for (i, thread) in threads.iter().enumerate() {
            let mut item = list.reborrow().get(i as u32);
            item.set_id(thread.id.0);
            item.set_name(thread.name.as_str());
        }
        Ok(())
    }

    async fn classes_by_name(
        self: capnp::capability::Rc<Self>,
        params: debuggee::ClassesByNameParams,
        mut results: debuggee::ClassesByNameResults,
    ) -> Result<(), Error> {
        let name = params.get()?.get_name()?.to_str()?;
        let classes = self.vm.classes_by_name(name).map_err(encode_error)?;
        let mut list = results.get().init_classes(classes.len() as u32);
        for (i, class) in classes.iter().enumerate() {
            let mut item = list.reborrow().get(i as u32);
            item.set_id(class.id.0);
            item.set_name(class.name.as_str());
        }
        Ok(())
    }

    async fn methods_by_name(
        self: capnp::capability::Rc<Self>,
        params: debuggee::MethodsByNameParams,
        mut results: debuggee::MethodsByNameResults,
    ) -> Result<(), Error> {
        let params = params.get()?;
        let class = ClassId(params.get_class());
        let name = params.get_name()?.to_str()?;
        let methods = self
            .vm
            .methods_by_name(class, name)
            .map_err(encode_error)?;
        let mut list = results.get().init_methods(methods.len() as u32);
        for (i, method) in methods.iter().enumerate() {
            let mut item = list.reborrow().get(i as u32);
            item.set_id(method.id.0);
            item.set_name(method.name.as_str());
            write_location(item.init_location(), &method.location);
        }
        Ok(())
    }

    async fn create_breakpoint(
        self: capnp::capability::Rc<Self>,
        params: debuggee::CreateBreakpointParams,
        mut results: debuggee::CreateBreakpointResults,
    ) -> Result<(), Error> {
        let params = params.get()?;
        let location = read_location(params.get_location()?);
        let thread = params
            .get_filtered()
            .then(|| ThreadId(params.get_thread()));
        let request = self
            .vm
            .create_breakpoint(&location, thread)
            .map_err(encode_error)?;
        results.get().set_request(request.0);
        Ok(())
    }

    async fn delete_all_breakpoints(
        self: capnp::capability::Rc<Self>,
        _params: debuggee::DeleteAllBreakpointsParams,
        _results: debuggee::DeleteAllBreakpointsResults,
    ) -> Result<(), Error> {
        self.vm.delete_all_breakpoints().map_err(encode_error)
    }

    async fn remove_event(
        self: capnp::capability::Rc<Self>,
        params: debuggee::RemoveEventParams,
        mut results: debuggee::RemoveEventResults,
    ) -> Result<(), Error> {
        let timeout = Duration::from_millis(params.get()?.get_timeout_millis());
        let events = self
            .waiter
            .remove_event(timeout)
            .await?
            .map_err(encode_error)?;

        let mut results = results.get();
        results.set_present(events.is_some());
        let events = events.unwrap_or_default();
        let mut list = results.init_events(events.len() as u32);
        for (i, e) in events.iter().enumerate() {
            write_event(list.reborrow().get(i as u32), e);
        }
        Ok(())
    }

    async fn suspend(
        self: capnp::capability::Rc<Self>,
        _params: debuggee::SuspendParams,
        _results: debuggee::SuspendResults,
    ) -> Result<(), Error> {
        self.vm.suspend().map_err(encode_error)
    }

    async fn resume(
        self: capnp::capability::Rc<Self>,
        _params: debuggee::ResumeParams,
        _results: debuggee::ResumeResults,
    ) -> Result<(), Error> {
        self.vm.resume().map_err(encode_error)
    }

    async fn invoke_method(
        self: capnp::capability::Rc<Self>,
        params: debuggee::InvokeMethodParams,
        mut results: debuggee::InvokeMethodResults,
    ) -> Result<(), Error> {
        let params = params.get()?;
        let thread = ThreadId(params.get_thread());
        let class = ClassId(params.get_class());
        let method = MethodId(params.get_method());
        let args = params
            .get_args()?
            .iter()
            .map(read_value)
            .collect::<Result<Vec<_>, _>>()?;

        let vm = self.vm.clone();
        let value = offload("teleshell-debug-invoke", move || {
            vm.invoke_method(thread, class, method, args)
        })
        .await?
        .map_err(encode_error)?;
        write_value(results.get().init_result(), &value);
        Ok(())
    }

    async fn frames(
        self: capnp::capability::Rc<Self>,
        params: debuggee::FramesParams,
        mut results: debuggee::FramesResults,
    ) -> Result<(), Error> {
        let thread = ThreadId(params.get()?.get_thread());
        let frames = self.vm.frames(thread).map_err(encode_error)?;
        let mut list = results.get().init_frames(frames.len() as u32);
        for (i, f) in frames.iter().enumerate() {
            let mut item = list.reborrow().get(i as u32);
            item.set_declaring_type(f.declaring_type.as_str());
            item.set_method(f.method.as_str());
            match f.this {
                Some(this) => item.set_receiver(this.0),
                None => item.set_no_receiver(()),
            }
            write_location(item.init_location(), &f.location);
        }
        Ok(())
    }

    async fn get_field(
        self: capnp::capability::Rc<Self>,
        params: debuggee::GetFieldParams,
        mut results: debuggee::GetFieldResults,
    ) -> Result<(), Error> {
        let params = params.get()?;
        let object = ObjectId(params.get_object());
        let field = params.get_field()?.to_str()?;
        let value = self
            .vm
            .get_field(object, field)
            .map_err(encode_error)?;
        write_value(results.get().init_value(), &value);
        Ok(())
    }

    async fn set_field(
        self: capnp::capability::Rc<Self>,
        params: debuggee::SetFieldParams,
        _results: debuggee::SetFieldResults,
    ) -> Result<(), Error> {
        let params = params.get()?;
        let object = ObjectId(params.get_object());
        let field = params.get_field()?.to_str()?;
        let value = read_value(params.get_value()?)?;
        self.vm
            .set_field(object, field, value)
            .map_err(encode_error)
    }

    async fn stop_thread(
        self: capnp::capability::Rc<Self>,
        params: debuggee::StopThreadParams,
        _results: debuggee::StopThreadResults,
    ) -> Result<(), Error> {
        let params = params.get()?;
        self.vm
            .stop_thread(
                ThreadId(params.get_thread()),
                ObjectId(params.get_exception()),
            )
            .map_err(encode_error)
    }

    async fn dispose(
        self: capnp::capability::Rc<Self>,
        _params: debuggee::DisposeParams,
        _results: debuggee::DisposeResults,
    ) -> Result<(), Error> {
        self.vm.dispose().map_err(encode_error)
    }
}

fn write_event(mut builder: event::Builder<'_>, e: &Event) {
    match e {
        Event::Breakpoint {
            request,
            thread,
            location,
        } => {
            let mut bp = builder.init_breakpoint();
            bp.set_request(request.0);
            bp.set_thread(thread.0);
            write_location(bp.init_location(), location);
        }
        Event::VmDeath(description) => builder.set_vm_death(description.as_str()),
        Event::VmDisconnect => builder.set_vm_disconnect(()),
    }
}

fn read_event(reader: event::Reader<'_>) -> Result<Event, Error> {
    Ok(match reader.which()? {
        event::Which::Breakpoint(bp) => Event::Breakpoint {
            request: RequestId(bp.get_request()),
            thread: ThreadId(bp.get_thread()),
            location: read_location(bp.get_location()?),
        },
        event::Which::VmDeath(description) => Event::VmDeath(description?.to_str()?.to_owned()),
        event::Which::VmDisconnect(()) => Event::VmDisconnect,
    })
}

fn read_frame(reader: frame::Reader<'_>) -> Result<StackFrame, Error> {
    Ok(StackFrame {
        location: read_location(reader.get_location()?),
        declaring_type: reader.get_declaring_type()?.to_str()?.to_owned(),
        method: reader.get_method()?.to_str()?.to_owned(),
        this: match reader.which()? {
            frame::Which::NoReceiver(()) => None,
            frame::Which::Receiver(id) => Some(ObjectId(id)),
        },
    })
}

/// Serves one debug connection until it ends.
pub async fn serve_connection(attachment: Attachment, stream: Async<TcpStream>) {
    let server = match DebuggeeServer::new(attachment) {
        Ok(server) => server,
        Err(e) => {
            warn!(target: "teleshell::operate", "cannot serve the debug connection: {e}");
            return;
        }
    };
    let (input, output) = stream.split();
    let client: debuggee::Client = capnp_rpc::new_client(server);
    let rpc_system = RpcSystem::new(
        Box::new(network(input, output, Side::Server)),
        Some(client.client),
    );
    if let Err(e) = rpc_system.await {
        debug!(target: "teleshell::operate", "debug connection interrupted: {e}");
    }
}

/// Controller side of the debug wire.
pub struct RemoteVm {
    bridge: RpcBridge<debuggee::Client>,
}

impl RemoteVm {
    /// Starts the debug connection over an established stream.
    pub fn connect(stream: TcpStream) -> std::io::Result<Self> {
        let bridge = RpcBridge::spawn("teleshell-debug-client", move |_spawner| {
            let stream = Async::new(stream)?;
            let (input, output) = stream.split();
            let mut rpc_system = RpcSystem::new(Box::new(network(input, output, Side::Client)), None);
            let debuggee: debuggee::Client = rpc_system.bootstrap(Side::Server);
            let driver: LocalBoxFuture<'static, ()> = rpc_system
                .map(|res| {
                    if let Err(e) = res {
                        warn!(target: "teleshell::operate", "debug connection interrupted: {e}");
                    }
                })
                .boxed_local();
            Ok((debuggee, driver))
        })?;
        Ok(Self { bridge })
    }

    fn request<T, F, Fut>(&self, f: F) -> Result<T, ControlError>
    where
        T: Send + 'static,
        F: FnOnce(debuggee::Client) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Error>> + 'static,
    {
        self.bridge
            .call(move |client: &debuggee::Client| f(client.clone()))
            .map_err(|_| ControlError::Disconnected)?
            .map_err(decode_error)
    }
}

impl VirtualMachine for RemoteVm {
    fn all_threads(&self) -> Result<Vec<ThreadRef>, ControlError> {
        self.request(|client| async move {
            let response = client.all_threads_request().send().promise.await?;
            response
                .get()?
                .get_threads()?
                .iter()
                .map(|t| {
                    Ok(ThreadRef {
                        id: ThreadId(t.get_id()),
                        name: t.get_name()?.to_str()?.to_owned(),
                    })
                })
                .collect::<Result<Vec<_>, Error>>()
        })
    }

    fn classes_by_name(&self, name: &str) -> Result<Vec<ClassRef>, ControlError> {
        let name = name.to_owned();
        self.request(|client| async move {
            let mut request = client.classes_by_name_request();
            request.get().set_name(name.as_str());
            let response = request.send().promise.await?;
            response
                .get()?
                .get_classes()?
                .iter()
                .map(|c| {
                    Ok(ClassRef {
                        id: ClassId(c.get_id()),
                        name: c.get_name()?.to_str()?.to_owned(),
                    })
                })
                .collect::<Result<Vec<_>, Error>>()
        })
    }

    fn methods_by_name(&self, class: ClassId, name: &str) -> Result<Vec<MethodRef>, ControlError> {
        let name = name.to_owned();
        self.request(move |client| async move {
            let mut request = client.methods_by_name_request();
            request.get().set_class(class.0);
            request.get().set_name(name.as_str());
            let response = request.send().promise.await?;
            response
                .get()?
                .get_methods()?
                .iter()
                .map(|m| {
                    Ok(MethodRef {
                        id: MethodId(m.get_id()),
                        name: m.get_name()?.to_str()?.to_owned(),
                        location: read_location(m.get_location()?),
                    })
                })
                .collect::<Result<Vec<_>, Error>>()
        })
    }

    fn create_breakpoint(
        &self,
        location: &Location,
        thread: Option<ThreadId>,
    ) -> Result<RequestId, ControlError> {
        let location = *location;
        self.request(move |client| async move {
            let mut request = client.create_breakpoint_request();
            write_location(request.get().init_location(), &location);
            request.get().set_filtered(thread.is_some());
            request.get().set_thread(thread.map_or(0, |t| t.0));
            let response = request.send().promise.await?;
            Ok::<_, Error>(RequestId(response.get()?.get_request()))
        })
    }

    fn delete_all_breakpoints(&self) -> Result<(), ControlError> {
        self.request(|client| async move {
            client.delete_all_breakpoints_request().send().promise.await?;
            Ok::<_, Error>(())
        })
    }

    fn remove_event(&self, timeout: Duration) -> Result<Option<EventSet>, ControlError> {
        let millis: u64 = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self.request(move |client| async move {
            let mut request = client.remove_event_request();
            request.get().set_timeout_millis(millis);
            let response = request.send().promise.await?;
            let response = response.get()?;
            if !response.get_present() {
                return Ok(None);
            }
            let events = response
                .get_events()?
                .iter()
                .map(read_event)
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, Error>(Some(events))
        })
    }

    fn suspend(&self) -> Result<(), ControlError> {
        self.request(|client| async move {
            client.suspend_request().send().promise.await?;
            Ok::<_, Error>(())
        })
    }

    fn resume(&self) -> Result<(), ControlError> {
        self.request(|client| async move {
            client.resume_request().send().promise.await?;
            Ok::<_, Error>(())
        })
    }

    fn invoke_method(
        &self,
        thread: ThreadId,
        class: ClassId,
        method: MethodId,
        args: Vec<Value>,
    ) -> Result<Value, ControlError> {
        self.request(move |client| async move {
            let mut request = client.invoke_method_request();
            {
                let mut params = request.get();
                params.set_thread(thread.0);
                params.set_class(class.0);
                params.set_method(method.0);
                let mut list = params.init_args(args.len() as u32);
                for (i, arg) in args.iter().enumerate() {
                    write_value(list.reborrow().get(i as u32), arg);
                }
            }
            let response = request.send().promise.await?;
            read_value(response.get()?.get_result()?)
        })
    }

    fn frames(&self, thread: ThreadId) -> Result<Vec<StackFrame>, ControlError> {
        self.request(move |client| async move {
            let mut request = client.frames_request();
            request.get().set_thread(thread.0);
            let response = request.send().promise.await?;
            response
                .get()?
                .get_frames()?
                .iter()
                .map(read_frame)
                .collect::<Result<Vec<_>, Error>>()
        })
    }

    fn get_field(&self, object: ObjectId, field: &str) -> Result<Value, ControlError> {
        let field = field.to_owned();
        self.request(move |client| async move {
            let mut request = client.get_field_request();
            request.get().set_object(object.0);
            request.get().set_field(field.as_str());
            let response = request.send().promise.await?;
            read_value(response.get()?.get_value()?)
        })
    }

    fn set_field(&self, object: ObjectId, field: &str, value: Value) -> Result<(), ControlError> {
        let field = field.to_owned();
        self.request(move |client| async move {
            let mut request = client.set_field_request();
            request.get().set_object(object.0);
            request.get().set_field(field.as_str());
            write_value(request.get().init_value(), &value);
            request.send().promise.await?;
            Ok::<_, Error>(())
        })
    }

    fn stop_thread(&self, thread: ThreadId, exception: ObjectId) -> Result<(), ControlError> {
        self.request(move |client| async move {
            let mut request = client.stop_thread_request();
            request.get().set_thread(thread.0);
            request.get().set_exception(exception.0);
            request.send().promise.await?;
            Ok::<_, Error>(())
        })
    }

    fn dispose(&self) -> Result<(), ControlError> {
        if self.bridge.is_closed() {
            return Ok(());
        }
        let result = self.request(|client| async move {
            client.dispose_request().send().promise.await?;
            Ok::<_, Error>(())
        });
        self.bridge.close();
        result
    }
}

impl Drop for RemoteVm {
    fn drop(&mut self) {
        self.bridge.close();
    }
}
