//! Execution wire: snippet requests and redirected streams.
//!
//! The controller drives an [`ExecutionClient`] and serves its local streams, the target runs
//! [`serve_agent`] and answers [`Job`]s from its executor.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    io::{Read, Write},
    rc::Rc,
    sync::{mpsc, Arc, Mutex},
};

use async_net::TcpStream;
use capnp::Error;
use capnp_rpc::{rpc_twoparty_capnp::Side, RpcSystem};
use futures::{channel::oneshot, future::LocalBoxFuture, AsyncReadExt, FutureExt};
use log::{debug, warn};

use super::{
    agent_capnp::{execution, input_source, outcome, output_sink, remote_agent},
    bridge::RpcBridge,
    network, offload,
};
use crate::internal::lock;

/// Name of the stream receiving the target's standard output.
pub const OUT: &str = "out";
/// Name of the stream receiving the target's standard error.
pub const ERR: &str = "err";
/// Name of the stream feeding the target's standard input.
pub const IN: &str = "in";

/// Result of a snippet request as reported by the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Rendered value of the snippet.
    Value(String),
    /// The snippet failed.
    RunError(String),
    /// The snippet was stopped on behalf of the controller.
    Stopped,
    /// The target could not run the snippet.
    Internal(String),
}

fn write_outcome(mut builder: outcome::Builder<'_>, o: &Outcome) {
    match o {
        Outcome::Value(value) => builder.set_value(value.as_str()),
        Outcome::RunError(message) => builder.set_run_error(message.as_str()),
        Outcome::Stopped => builder.set_stopped(()),
        Outcome::Internal(message) => builder.set_internal(message.as_str()),
    }
}

fn read_outcome(reader: outcome::Reader<'_>) -> Result<Outcome, Error> {
    Ok(match reader.which()? {
        outcome::Which::Value(value) => Outcome::Value(value?.to_str()?.to_owned()),
        outcome::Which::RunError(message) => Outcome::RunError(message?.to_str()?.to_owned()),
        outcome::Which::Stopped(()) => Outcome::Stopped,
        outcome::Which::Internal(message) => Outcome::Internal(message?.to_str()?.to_owned()),
    })
}

/// Failure to carry a request over the execution wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("execution channel closed")]
    Disconnected,
    #[error("execution channel failure: {0}")]
    Failed(String),
}

impl From<Error> for CallError {
    fn from(error: Error) -> Self {
        match error.kind {
            capnp::ErrorKind::Disconnected => CallError::Disconnected,
            _ => CallError::Failed(error.to_string()),
        }
    }
}

/// Local streams redirected from the target.
pub struct ExecutionEnv {
    outputs: Vec<(String, Box<dyn Write + Send>)>,
    inputs: Vec<(String, Box<dyn Read + Send>)>,
}

impl ExecutionEnv {
    /// No stream at all: target output is discarded and input is at end of file.
    pub fn new() -> Self {
        Self {
            outputs: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// The controller's own standard streams.
    pub fn stdio() -> Self {
        Self::new()
            .with_output(OUT, std::io::stdout())
            .with_output(ERR, std::io::stderr())
            .with_input(IN, std::io::stdin())
    }

    pub fn with_output(mut self, name: &str, writer: impl Write + Send + 'static) -> Self {
        self.outputs.push((name.to_owned(), Box::new(writer)));
        self
    }

    pub fn with_input(mut self, name: &str, reader: impl Read + Send + 'static) -> Self {
        self.inputs.push((name.to_owned(), Box::new(reader)));
        self
    }
}

impl Default for ExecutionEnv {
    fn default() -> Self {
        Self::new()
    }
}

struct OutputSinkServer {
    writer: RefCell<Box<dyn Write + Send>>,
}

impl output_sink::Server for OutputSinkServer {
    async fn write(
        self: capnp::capability::Rc<Self>,
        params: output_sink::WriteParams,
        _results: output_sink::WriteResults,
    ) -> Result<(), Error> {
        let data = params.get()?.get_data()?;
        let mut writer = self.writer.borrow_mut();
        writer
            .write_all(data)
            .and_then(|()| writer.flush())
            .map_err(|e| Error::failed(format!("cannot write: {e}")))
    }
}

struct InputSourceServer {
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
}

impl input_source::Server for InputSourceServer {
    async fn read(
        self: capnp::capability::Rc<Self>,
        params: input_source::ReadParams,
        mut results: input_source::ReadResults,
    ) -> Result<(), Error> {
        let max = params.get()?.get_max() as usize;
        let reader = self.reader.clone();
        let data = offload("teleshell-input", move || {
            let mut buf = vec![0; max];
            let n = lock(&reader).read(&mut buf)?;
            buf.truncate(n);
            Ok::<_, std::io::Error>(buf)
        })
        .await?
        .map_err(|e| Error::failed(format!("cannot read: {e}")))?;
        results.get().set_data(data.as_slice());
        Ok(())
    }
}

struct ClientState {
    agent: remote_agent::Client,
    execution: RefCell<Option<execution::Client>>,
}

/// Controller end of the execution wire.
pub struct ExecutionClient {
    bridge: RpcBridge<Rc<ClientState>>,
}

impl ExecutionClient {
    /// Starts the execution wire over an accepted connection and opens the remote agent with the
    /// streams of `env`, outputs first.
    pub fn open(stream: TcpStream, env: ExecutionEnv) -> Result<Self, CallError> {
        let bridge = RpcBridge::spawn("teleshell-execution", move |_spawner| {
            let (input, output) = stream.split();
            let mut rpc_system =
                RpcSystem::new(Box::new(network(input, output, Side::Client)), None);
            let agent: remote_agent::Client = rpc_system.bootstrap(Side::Server);
            let driver: LocalBoxFuture<'static, ()> = rpc_system
                .map(|res| {
                    if let Err(e) = res {
                        debug!(target: "teleshell::operate", "execution channel interrupted: {e}");
                    }
                })
                .boxed_local();
            let state = Rc::new(ClientState {
                agent,
                execution: RefCell::new(None),
            });
            Ok((state, driver))
        })
        .map_err(|e| CallError::Failed(format!("cannot start execution channel: {e}")))?;

        bridge
            .call(move |state: &Rc<ClientState>| {
                let state = state.clone();
                async move {
                    let mut request = state.agent.open_request();
                    {
                        let mut params = request.get();
                        let mut outputs = params.reborrow().init_outputs(env.outputs.len() as u32);
                        for (i, (name, writer)) in env.outputs.into_iter().enumerate() {
                            let mut named = outputs.reborrow().get(i as u32);
                            named.set_name(name.as_str());
                            named.set_sink(capnp_rpc::new_client(OutputSinkServer {
                                writer: RefCell::new(writer),
                            }));
                        }
                        let mut inputs = params.init_inputs(env.inputs.len() as u32);
                        for (i, (name, reader)) in env.inputs.into_iter().enumerate() {
                            let mut named = inputs.reborrow().get(i as u32);
                            named.set_name(name.as_str());
                            named.set_source(capnp_rpc::new_client(InputSourceServer {
                                reader: Arc::new(Mutex::new(reader)),
                            }));
                        }
                    }
                    let response = request.send().promise.await?;
                    let execution = response.get()?.get_execution()?;
                    *state.execution.borrow_mut() = Some(execution);
                    Ok::<_, Error>(())
                }
            })
            .map_err(|_| CallError::Disconnected)??;

        Ok(Self { bridge })
    }

    /// Runs a snippet in the target.
    pub fn invoke(&self, snippet: &str) -> Result<Outcome, CallError> {
        let snippet = snippet.to_owned();
        self.request(move |execution| async move {
            let mut request = execution.invoke_request();
            request.get().set_snippet(snippet.as_str());
            let response = request.send().promise.await?;
            read_outcome(response.get()?.get_outcome()?)
        })
    }

    /// Renders the value of a variable defined by earlier snippets.
    pub fn var_value(&self, name: &str) -> Result<Outcome, CallError> {
        let name = name.to_owned();
        self.request(move |execution| async move {
            let mut request = execution.var_value_request();
            request.get().set_name(name.as_str());
            let response = request.send().promise.await?;
            read_outcome(response.get()?.get_outcome()?)
        })
    }

    /// Drops the connection; the target ends its side.
    pub fn close(&self) {
        self.bridge.close();
    }

    pub fn is_closed(&self) -> bool {
        self.bridge.is_closed()
    }

    fn request<F, Fut>(&self, f: F) -> Result<Outcome, CallError>
    where
        F: FnOnce(execution::Client) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Outcome, Error>> + 'static,
    {
        let result = self
            .bridge
            .call(move |state: &Rc<ClientState>| {
                let execution = state.execution.borrow().clone();
                async move {
                    match execution {
                        Some(execution) => f(execution).await,
                        None => Err(Error::failed("execution not open".to_owned())),
                    }
                }
            })
            .map_err(|_| CallError::Disconnected)?;
        Ok(result?)
    }
}

impl Drop for ExecutionClient {
    fn drop(&mut self) {
        self.bridge.close();
    }
}

/// Snippet request received from the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Invoke(String),
    VarValue(String),
}

/// A request waiting for its outcome.
pub struct Job {
    pub request: Request,
    reply: oneshot::Sender<Outcome>,
}

impl Job {
    pub fn respond(self, outcome: Outcome) {
        if self.reply.send(outcome).is_err() {
            debug!(target: "teleshell::operate", "controller gave up waiting for an outcome");
        }
    }
}

/// Streams bound by the controller on the target side.
#[derive(Default)]
pub struct StreamTable {
    outputs: RefCell<BTreeMap<String, output_sink::Client>>,
    inputs: RefCell<BTreeMap<String, input_source::Client>>,
}

struct RemoteAgentServer {
    streams: Rc<StreamTable>,
    jobs: mpsc::Sender<Job>,
}

impl remote_agent::Server for RemoteAgentServer {
    async fn open(
        self: capnp::capability::Rc<Self>,
        params: remote_agent::OpenParams,
        mut results: remote_agent::OpenResults,
    ) -> Result<(), Error> {
        let params = params.get()?;
        {
            let mut outputs = self.streams.outputs.borrow_mut();
            for named in params.get_outputs()?.iter() {
                outputs.insert(named.get_name()?.to_str()?.to_owned(), named.get_sink()?);
            }
        }
        {
            let mut inputs = self.streams.inputs.borrow_mut();
            for named in params.get_inputs()?.iter() {
                inputs.insert(named.get_name()?.to_str()?.to_owned(), named.get_source()?);
            }
        }
        results
            .get()
            .set_execution(capnp_rpc::new_client(ExecutionServer {
                jobs: self.jobs.clone(),
            }));
        Ok(())
    }
}

struct ExecutionServer {
    jobs: mpsc::Sender<Job>,
}

impl ExecutionServer {
    async fn submit(&self, request: Request) -> Result<Outcome, Error> {
        let (reply, outcome) = oneshot::channel();
        self.jobs
            .send(Job { request, reply })
            .map_err(|_| Error::disconnected("executor is gone".to_owned()))?;
        outcome
            .await
            .map_err(|_| Error::failed("executor dropped the request".to_owned()))
    }
}

impl execution::Server for ExecutionServer {
    async fn invoke(
        self: capnp::capability::Rc<Self>,
        params: execution::InvokeParams,
        mut results: execution::InvokeResults,
    ) -> Result<(), Error> {
        let snippet = params.get()?.get_snippet()?.to_str()?.to_owned();
        let outcome = self.submit(Request::Invoke(snippet)).await?;
        write_outcome(results.get().init_outcome(), &outcome);
        Ok(())
    }

    async fn var_value(
        self: capnp::capability::Rc<Self>,
        params: execution::VarValueParams,
        mut results: execution::VarValueResults,
    ) -> Result<(), Error> {
        let name = params.get()?.get_name()?.to_str()?.to_owned();
        let outcome = self.submit(Request::VarValue(name)).await?;
        write_outcome(results.get().init_outcome(), &outcome);
        Ok(())
    }
}

/// Target end of the execution wire, used by the executor to reach the controller's streams.
#[derive(Clone)]
pub struct AgentStreams {
    bridge: RpcBridge<Rc<StreamTable>>,
}

impl AgentStreams {
    /// Writes to the named output stream. Writes to unbound streams are dropped.
    pub fn write(&self, name: &str, data: &[u8]) -> Result<(), CallError> {
        let name = name.to_owned();
        let data = data.to_vec();
        self.bridge
            .call(move |streams: &Rc<StreamTable>| {
                let sink = streams.outputs.borrow().get(&name).cloned();
                async move {
                    let Some(sink) = sink else {
                        return Ok(());
                    };
                    let mut request = sink.write_request();
                    request.get().set_data(data.as_slice());
                    request.send().promise.await?;
                    Ok::<_, Error>(())
                }
            })
            .map_err(|_| CallError::Disconnected)??;
        Ok(())
    }

    /// Reads at most `max` bytes from the named input stream. Empty means end of input, which
    /// is also what an unbound stream gives.
    pub fn read(&self, name: &str, max: u32) -> Result<Vec<u8>, CallError> {
        let name = name.to_owned();
        let data = self
            .bridge
            .call(move |streams: &Rc<StreamTable>| {
                let source = streams.inputs.borrow().get(&name).cloned();
                async move {
                    let Some(source) = source else {
                        return Ok(Vec::new());
                    };
                    let mut request = source.read_request();
                    request.get().set_max(max);
                    let response = request.send().promise.await?;
                    Ok::<_, Error>(response.get()?.get_data()?.to_vec())
                }
            })
            .map_err(|_| CallError::Disconnected)??;
        Ok(data)
    }

    /// Drops the connection.
    pub fn close(&self) {
        self.bridge.close();
    }
}

/// Serves the remote agent over a dialed-back connection.
///
/// Returns the handle on the controller's streams and the queue of snippet requests. The queue
/// disconnects when the connection ends.
pub fn serve_agent(stream: TcpStream) -> std::io::Result<(AgentStreams, mpsc::Receiver<Job>)> {
    let (jobs, queue) = mpsc::channel();
    let bridge = RpcBridge::spawn("teleshell-agent-rpc", move |_spawner| {
        let (input, output) = stream.split();
        let streams = Rc::new(StreamTable::default());
        let agent: remote_agent::Client = capnp_rpc::new_client(RemoteAgentServer {
            streams: streams.clone(),
            jobs,
        });
        let driver: LocalBoxFuture<'static, ()> = RpcSystem::new(
            Box::new(network(input, output, Side::Server)),
            Some(agent.client),
        )
        .map(|res| {
            if let Err(e) = res {
                warn!(target: "teleshell::operate", "agent connection interrupted: {e}");
            }
        })
        .boxed_local();
        Ok((streams, driver))
    })?;
    Ok((AgentStreams { bridge }, queue))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::{net::TcpListener, thread};

    use assert_matches::assert_matches;
    use async_io::Async;

    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            lock(&self.0).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = thread::spawn(move || std::net::TcpStream::connect(addr).unwrap());
        let (accepted, _) = listener.accept().unwrap();
        (
            Async::new(accepted).unwrap().into(),
            Async::new(dialer.join().unwrap()).unwrap().into(),
        )
    }

    #[test]
    fn test_requests_and_streams() {
        let (controller_end, target_end) = pair();
        let (streams, jobs) = serve_agent(target_end).unwrap();

        let executor = thread::spawn(move || {
            for job in jobs {
                let outcome = match &job.request {
                    Request::Invoke(snippet) => {
                        streams.write(OUT, snippet.as_bytes()).unwrap();
                        let line = streams.read(IN, 64).unwrap();
                        Outcome::Value(String::from_utf8(line).unwrap())
                    }
                    Request::VarValue(name) => Outcome::RunError(format!("no {name}")),
                };
                job.respond(outcome);
            }
        });

        let out = SharedBuf::default();
        let env = ExecutionEnv::new()
            .with_output(OUT, out.clone())
            .with_input(IN, &b"typed"[..]);
        let client = ExecutionClient::open(controller_end, env).unwrap();

        assert_eq!(
            client.invoke("echo").unwrap(),
            Outcome::Value("typed".to_owned())
        );
        assert_eq!(lock(&out.0).as_slice(), b"echo");
        assert_eq!(
            client.var_value("x").unwrap(),
            Outcome::RunError("no x".to_owned())
        );

        client.close();
        assert_matches!(client.invoke("again"), Err(CallError::Disconnected));
        executor.join().unwrap();
    }
}
