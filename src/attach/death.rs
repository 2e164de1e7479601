//! Observes the exit of the target.

use std::{
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    cancellation::CancellationToken,
    control::{ControlError, Event, VirtualMachine},
    internal::lock,
};

const POLL: Duration = Duration::from_millis(250);

/// Called with a description of the exit.
pub type ExitCallback = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    callbacks: Vec<ExitCallback>,
    /// Set once the exit was observed.
    exit: Option<String>,
}

/// Background observer of the target exit.
///
/// Callbacks run in registration order, once. A callback registered after the exit runs at
/// once.
pub struct DeathWatcher {
    listeners: Arc<Mutex<Listeners>>,
    cancellation_token: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeathWatcher {
    /// Starts watching the event queue of `vm`.
    pub fn spawn(vm: Arc<dyn VirtualMachine>) -> std::io::Result<Self> {
        let listeners = Arc::new(Mutex::new(Listeners::default()));
        let cancellation_token = CancellationToken::new();

        let thread = std::thread::Builder::new()
            .name("teleshell-death-watcher".to_owned())
            .spawn({
                let listeners = listeners.clone();
                let cancellation_token = cancellation_token.clone();
                move || {
                    if let Some(description) = watch(vm.as_ref(), &cancellation_token) {
                        info!(target: "teleshell::attach", "target exited: {description}");
                        notify(&listeners, description);
                    }
                }
            })?;

        Ok(Self {
            listeners,
            cancellation_token,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn on_exit(&self, callback: ExitCallback) {
        let mut listeners = lock(&self.listeners);
        match &listeners.exit {
            Some(description) => {
                let description = description.clone();
                drop(listeners);
                callback(&description);
            }
            None => listeners.callbacks.push(callback),
        }
    }

    pub fn has_exited(&self) -> bool {
        lock(&self.listeners).exit.is_some()
    }

    /// Description of the exit, once observed.
    pub fn exit_description(&self) -> Option<String> {
        lock(&self.listeners).exit.clone()
    }

    /// Stops watching. Callbacks are not invoked afterwards.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    /// Stops watching and waits until the event queue is no longer polled.
    ///
    /// A wait in progress ends with its poll period or as soon as the controller detaches.
    pub fn join(&self) {
        self.cancel();
        let Some(thread) = lock(&self.thread).take() else {
            return;
        };
        // A callback may close the session from the watcher thread itself.
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            warn!(target: "teleshell::attach", "death watcher panicked");
        }
    }
}

impl Drop for DeathWatcher {
    fn drop(&mut self) {
        self.join();
    }
}

fn watch(vm: &dyn VirtualMachine, cancellation_token: &CancellationToken) -> Option<String> {
    while !cancellation_token.is_cancelled() {
        match vm.remove_event(POLL) {
            Ok(None) => {}
            Ok(Some(events)) => {
                let mut stray = false;
                for event in events {
                    match event {
                        Event::VmDeath(description) => return Some(description),
                        Event::VmDisconnect => return Some("disconnected".to_owned()),
                        Event::Breakpoint { location, .. } => {
                            debug!(target: "teleshell::attach", "late trap event at {location}");
                            stray = true;
                        }
                    }
                }
                if stray {
                    // The event set suspended the target.
                    if let Err(e) = vm.resume() {
                        debug!(target: "teleshell::attach", "cannot resume after a late event: {e}");
                    }
                }
            }
            Err(ControlError::Disconnected) => {
                return (!cancellation_token.is_cancelled()).then(|| "disconnected".to_owned());
            }
            Err(e) => {
                debug!(target: "teleshell::attach", "event queue failure: {e}");
                if cancellation_token.wait_timeout(POLL) {
                    break;
                }
            }
        }
    }
    None
}

fn notify(listeners: &Mutex<Listeners>, description: String) {
    let callbacks = {
        let mut listeners = lock(listeners);
        if listeners.exit.is_some() {
            return;
        }
        listeners.exit = Some(description.clone());
        std::mem::take(&mut listeners.callbacks)
    };
    for callback in callbacks {
        callback(&description);
    }
}
