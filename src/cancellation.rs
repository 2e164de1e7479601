//! Simple cancellation token.
//!
//! It is awaited by async loops (the debug server accept loop) and polled or waited on by plain
//! threads (the death watcher, the demonstration target).

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Waker},
    time::Duration,
};

struct State {
    cancelled: bool,
    wakers: Vec<Waker>,
}

struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The cancellation token.
///
/// Clone it to listen to the same cancellation event.
#[derive(Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    cancelled: false,
                    wakers: Vec::new(),
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Signals cancellation and wakes up all the waiters, async or blocking.
    pub fn cancel(&self) {
        let mut state = self.shared.lock();
        state.cancelled = true;

        for waker in state.wakers.drain(..) {
            waker.wake();
        }
        self.shared.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().cancelled
    }

    /// Blocks the current thread until cancellation or until `timeout` elapses.
    ///
    /// Returns whether the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .condvar
            .wait_timeout_while(state, timeout, |state| !state.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        state.cancelled
    }

    /// Returns a Future that completes when cancellation is requested.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        CancelledFuture {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

struct CancelledFuture {
    shared: Arc<Shared>,
}

impl Future for CancelledFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.lock();

        if state.cancelled {
            return Poll::Ready(());
        }

        let current_waker = cx.waker();
        if !state.wakers.iter().any(|w| current_waker.will_wake(w)) {
            state.wakers.push(current_waker.clone());
        }

        Poll::Pending
    }
}
