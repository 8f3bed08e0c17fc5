//! Completion signalling for `quit` and `abort`.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use audioio_types::StreamState;

/// Callback run once with the final state.
pub type CompletionCallback = Box<dyn FnOnce(&StreamState) + Send + 'static>;

/// Waits for a stream to reach its final state.
pub struct Completion {
    rx: Receiver<StreamState>,
    settled: Mutex<Option<StreamState>>,
}

impl Completion {
    /// Blocks until the stream has settled and returns its final state.
    pub fn wait(&self) -> StreamState {
        let mut settled = self.settled.lock();
        if let Some(state) = settled.as_ref() {
            return state.clone();
        }
        // The sender is only dropped after sending, unless the engine went away.
        let state = self.rx.recv().unwrap_or(StreamState::Aborted);
        *settled = Some(state.clone());
        state
    }

    /// Like [`wait`](Self::wait) with a deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<StreamState> {
        let mut settled = self.settled.lock();
        if let Some(state) = settled.as_ref() {
            return Some(state.clone());
        }
        let state = self.rx.recv_timeout(timeout).ok()?;
        *settled = Some(state.clone());
        Some(state)
    }

    /// Whether the final state is available.
    pub fn is_complete(&self) -> bool {
        let mut settled = self.settled.lock();
        if settled.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(state) => {
                *settled = Some(state);
                true
            }
            Err(_) => false,
        }
    }
}

/// First-settle-wins record of a stream's final state.
#[derive(Default)]
pub(crate) struct Settlement {
    inner: Mutex<SettlementInner>,
}

#[derive(Default)]
struct SettlementInner {
    outcome: Option<StreamState>,
    waiters: Vec<Sender<StreamState>>,
    callbacks: Vec<CompletionCallback>,
}

impl Settlement {
    /// Registers a waiter. If already settled the completion is ready and the
    /// callback runs immediately on this thread.
    pub fn register(&self, callback: Option<CompletionCallback>) -> Completion {
        let (tx, rx) = bounded(1);
        let mut inner = self.inner.lock();
        let outcome = inner.outcome.clone();
        match outcome {
            Some(state) => {
                drop(inner);
                let _ = tx.send(state.clone());
                if let Some(callback) = callback {
                    callback(&state);
                }
            }
            None => {
                inner.waiters.push(tx);
                if let Some(callback) = callback {
                    inner.callbacks.push(callback);
                }
            }
        }

        Completion {
            rx,
            settled: Mutex::new(None),
        }
    }

    /// Records the final state. Returns false if already settled.
    pub fn settle(&self, state: StreamState) -> bool {
        let (waiters, callbacks) = {
            let mut inner = self.inner.lock();
            if inner.outcome.is_some() {
                return false;
            }
            inner.outcome = Some(state.clone());
            (
                std::mem::take(&mut inner.waiters),
                std::mem::take(&mut inner.callbacks),
            )
        };

        for waiter in waiters {
            let _ = waiter.send(state.clone());
        }
        for callback in callbacks {
            callback(&state);
        }
        true
    }
}
