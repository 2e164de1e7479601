//! Sub-module where attaching to a target is implemented.
//!
//! [`attach`] runs the whole sequence:
//!
//! 1. listen on an ephemeral port ([`channel`])
//! 2. attach through a [connector](connector) and find the reserved thread ([`trap`])
//! 3. trap the reserved thread, force it to invoke the entry point with `host:port`, release the
//!    target ([`handshake`])
//! 4. watch for the target exit ([`death`])
//! 5. accept the dial-back connection, unless the target exits first, and open the execution wire
//!
//! The resulting [`Session`] runs snippets and can [stop](Session::stop) the one in flight
//! ([`interrupt`]).

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::{
    cancellation::CancellationToken,
    config::ConnectionParams,
    contract::{HandshakeArgument, UserCodeMarker},
    control::{ThreadRef, VirtualMachine},
    internal::lock,
    operate::capnp::execution::{ExecutionClient, Outcome},
};

pub use crate::operate::capnp::execution::ExecutionEnv;
pub use error::{AttachError, ExecutionError};

pub mod channel;
pub mod connector;
pub mod death;
mod error;
pub mod handshake;
pub mod interrupt;
pub mod trap;

#[cfg(test)]
mod scripted;

use channel::{advertised_host, ChannelError, ChannelListener};
use connector::{arguments_for, find_connector};
use death::{DeathWatcher, ExitCallback};
use interrupt::Interrupter;

type Target = Arc<Mutex<Option<Arc<dyn VirtualMachine>>>>;

/// An established attachment to a target.
///
/// Closing the session, explicitly or by dropping it, detaches from the target without
/// stopping it.
pub struct Session {
    target: Target,
    reserved_thread: ThreadRef,
    channel: ExecutionClient,
    interrupter: Interrupter,
    watcher: DeathWatcher,
}

/// Attaches to the target described by `params`, redirecting its streams to the standard
/// streams of the current process.
pub fn attach(params: &ConnectionParams) -> Result<Session, AttachError> {
    attach_with_env(params, ExecutionEnv::stdio())
}

/// Attaches to the target described by `params`, redirecting its streams to `env`.
pub fn attach_with_env(
    params: &ConnectionParams,
    env: ExecutionEnv,
) -> Result<Session, AttachError> {
    let connector = find_connector(&params.connector).ok_or_else(|| {
        AttachError::AttachFailure(format!("no connector named {}", params.connector))
    })?;

    // Listening before attaching, the target may dial back as soon as it is released.
    let listener = ChannelListener::bind()?;
    let argument = HandshakeArgument::new(advertised_host(&params.hostname), listener.port());

    let vm = connector.attach(&arguments_for(connector.as_ref(), params))?;
    info!(
        target: "teleshell::attach",
        "attached to {}:{} with {}", params.hostname, params.port, connector.name()
    );

    match establish(&vm, params, listener, &argument, env) {
        Ok((reserved_thread, channel, watcher)) => Ok(Session::new(
            vm,
            reserved_thread,
            channel,
            watcher,
            params,
        )),
        Err(e) => {
            if let Err(e) = vm.dispose() {
                debug!(target: "teleshell::attach", "cannot detach after a failed attach: {e}");
            }
            Err(e)
        }
    }
}

fn establish(
    vm: &Arc<dyn VirtualMachine>,
    params: &ConnectionParams,
    listener: ChannelListener,
    argument: &HandshakeArgument,
    env: ExecutionEnv,
) -> Result<(ThreadRef, ExecutionClient, DeathWatcher), AttachError> {
    let reserved_thread = trap::find_reserved_thread(vm.as_ref())?;
    debug!(target: "teleshell::attach", "reserved thread is {} ({})", reserved_thread.name, reserved_thread.id);

    handshake::run(vm.as_ref(), reserved_thread.id, argument, params.timeout)?;

    // Watching before accepting, an exit before the dial-back fails the attach at once.
    let watcher = DeathWatcher::spawn(vm.clone())?;
    let exited = CancellationToken::new();
    watcher.on_exit(Box::new({
        let exited = exited.clone();
        move |_: &str| exited.cancel()
    }));

    let stream = listener
        .accept_unless(params.timeout, &exited)
        .map_err(|e| match e {
            ChannelError::Aborted => AttachError::AttachFailure(format!(
                "target exited before connecting back: {}",
                watcher.exit_description().unwrap_or_default()
            )),
            e => e.into(),
        })?;
    let channel = ExecutionClient::open(stream, env)
        .map_err(|e| AttachError::ProtocolViolation(format!("cannot open the agent: {e}")))?;
    Ok((reserved_thread, channel, watcher))
}

impl Session {
    fn new(
        vm: Arc<dyn VirtualMachine>,
        reserved_thread: ThreadRef,
        channel: ExecutionClient,
        watcher: DeathWatcher,
        params: &ConnectionParams,
    ) -> Self {
        let target: Target = Arc::new(Mutex::new(Some(vm)));
        watcher.on_exit(Box::new({
            let target = target.clone();
            move |_: &str| {
                lock(&target).take();
            }
        }));

        Self {
            target,
            reserved_thread,
            channel,
            interrupter: Interrupter::new(UserCodeMarker::new(params.remote_agent.as_str())),
            watcher,
        }
    }

    pub fn reserved_thread(&self) -> &ThreadRef {
        &self.reserved_thread
    }

    /// Whether the target is still attached.
    pub fn is_alive(&self) -> bool {
        lock(&self.target).is_some()
    }

    /// Runs `snippet` in the target and returns its rendered value.
    pub fn invoke(&self, snippet: &str) -> Result<String, ExecutionError> {
        self.vm()?;
        let _running = self.interrupter.begin();
        into_result(self.channel.invoke(snippet)?)
    }

    /// Renders the value of a variable defined by earlier snippets.
    pub fn var_value(&self, name: &str) -> Result<String, ExecutionError> {
        self.vm()?;
        let _running = self.interrupter.begin();
        into_result(self.channel.var_value(name)?)
    }

    /// Stops the snippet running in the target, if any.
    pub fn stop(&self) -> Result<(), ExecutionError> {
        let vm = self.vm()?;
        self.interrupter.stop(vm.as_ref())?;
        Ok(())
    }

    /// Registers a callback for the target exit. Callbacks run in registration order.
    pub fn on_exit(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        let callback: ExitCallback = Box::new(callback);
        self.watcher.on_exit(callback);
    }

    /// Detaches from the target, which keeps running. Closing twice is harmless.
    ///
    /// Once it returns, nothing of this session consumes the target's events anymore.
    pub fn close(&self) {
        self.watcher.cancel();
        let vm = lock(&self.target).take();
        if let Some(vm) = vm {
            if let Err(e) = vm.dispose() {
                warn!(target: "teleshell::attach", "cannot detach cleanly: {e}");
            }
            info!(target: "teleshell::attach", "detached");
        }
        self.watcher.join();
        self.channel.close();
    }

    fn vm(&self) -> Result<Arc<dyn VirtualMachine>, ExecutionError> {
        lock(&self.target)
            .clone()
            .ok_or(ExecutionError::EngineTerminated)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn into_result(outcome: Outcome) -> Result<String, ExecutionError> {
    match outcome {
        Outcome::Value(value) => Ok(value),
        Outcome::RunError(message) => Err(ExecutionError::Run(message)),
        Outcome::Stopped => Err(ExecutionError::Stopped),
        Outcome::Internal(message) => Err(ExecutionError::Internal(message)),
    }
}
