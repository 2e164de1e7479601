//! Thread bridge for Cap'n Proto connections.
//!
//! The RPC system is single-threaded. [`RpcBridge::spawn`] moves a connection to a dedicated
//! thread running a local executor, and [`RpcBridge::call`] ships closures to that thread. The
//! closure builds its future there, next to the capabilities, and the caller blocks on the
//! result.

use std::future::Future;

use futures::{
    channel::{mpsc, oneshot},
    executor::{block_on, LocalPool, LocalSpawner},
    future::LocalBoxFuture,
    task::LocalSpawnExt,
    FutureExt, StreamExt,
};
use log::{debug, warn};

type Job<C> = Box<dyn FnOnce(&C) -> LocalBoxFuture<'static, ()> + Send>;

/// The connection thread is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection closed")]
pub struct Disconnected;

/// Sending side of a connection thread.
///
/// `C` is the state living on the connection thread, typically a capability client.
pub struct RpcBridge<C> {
    jobs: mpsc::UnboundedSender<Job<C>>,
}

impl<C> Clone for RpcBridge<C> {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
        }
    }
}

impl<C: 'static> RpcBridge<C> {
    /// Starts a connection thread.
    ///
    /// `setup` runs on the new thread and returns the connection state along with the future
    /// driving the connection. The thread ends when that future completes or when the bridge is
    /// [closed](RpcBridge::close).
    pub fn spawn<S>(name: impl Into<String>, setup: S) -> std::io::Result<Self>
    where
        S: FnOnce(&LocalSpawner) -> std::io::Result<(C, LocalBoxFuture<'static, ()>)>
            + Send
            + 'static,
    {
        let name = name.into();
        let (jobs, mut queue) = mpsc::unbounded::<Job<C>>();

        std::thread::Builder::new().name(name.clone()).spawn(move || {
            let mut exec = LocalPool::new();
            let spawner = exec.spawner();

            exec.run_until(async move {
                let (state, driver) = match setup(&spawner) {
                    Ok(setup) => setup,
                    Err(e) => {
                        warn!(target: "teleshell::operate", "{name}: connection setup failed: {e}");
                        return;
                    }
                };
                let mut driver = driver.fuse();
                loop {
                    futures::select! {
                        () = driver => {
                            debug!(target: "teleshell::operate", "{name}: connection ended");
                            break;
                        }
                        job = queue.next() => match job {
                            Some(job) => {
                                if let Err(e) = spawner.spawn_local(job(&state)) {
                                    warn!(target: "teleshell::operate", "{name}: cannot spawn job: {e}");
                                    break;
                                }
                            }
                            None => {
                                debug!(target: "teleshell::operate", "{name}: closed");
                                break;
                            }
                        },
                    }
                }
            });
        })?;

        Ok(Self { jobs })
    }

    /// Runs `f` on the connection thread and blocks until its future completes.
    ///
    /// Must not be called from the connection thread itself.
    pub fn call<T, F, Fut>(&self, f: F) -> Result<T, Disconnected>
    where
        T: Send + 'static,
        F: FnOnce(&C) -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job<C> = Box::new(move |state| {
            let fut = f(state);
            async move {
                let _ = tx.send(fut.await);
            }
            .boxed_local()
        });
        self.jobs.unbounded_send(job).map_err(|_| Disconnected)?;
        block_on(rx).map_err(|_| Disconnected)
    }

    /// Stops the connection thread, which drops the connection.
    pub fn close(&self) {
        self.jobs.close_channel();
    }

    pub fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::{cell::Cell, rc::Rc, time::Duration};

    use assert_matches::assert_matches;
    use async_io::Timer;

    use super::*;

    #[test]
    fn test_calls_run_on_connection_thread() {
        let bridge = RpcBridge::spawn("test-bridge", |_spawner| {
            let state = Rc::new(Cell::new(0u32));
            Ok((state, futures::future::pending().boxed_local()))
        })
        .unwrap();

        for expected in 1..=3 {
            let value = bridge
                .call(|state: &Rc<Cell<u32>>| {
                    let state = state.clone();
                    async move {
                        Timer::after(Duration::from_millis(1)).await;
                        state.set(state.get() + 1);
                        state.get()
                    }
                })
                .unwrap();
            assert_eq!(value, expected);
        }

        bridge.close();
        assert!(bridge.is_closed());
        assert_matches!(bridge.call(|_state| async {}), Err(Disconnected));
    }

    #[test]
    fn test_driver_end_disconnects() {
        let bridge = RpcBridge::spawn("test-bridge-end", |_spawner| {
            Ok((
                (),
                async {
                    Timer::after(Duration::from_millis(10)).await;
                }
                .boxed_local(),
            ))
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_matches!(
            bridge.call(|_state| futures::future::pending::<()>()),
            Err(Disconnected)
        );
    }

    #[test]
    fn test_failed_setup_disconnects() {
        let bridge: RpcBridge<()> = RpcBridge::spawn("test-bridge-fail", |_spawner| {
            Err(std::io::Error::other("no way"))
        })
        .unwrap();
        assert_matches!(bridge.call(|_state| async { 1 }), Err(Disconnected));
    }
}
