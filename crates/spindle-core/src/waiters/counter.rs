use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{Pending, Reply, Wait, deferred, ready};

/// Resolves waiters whenever `counter == target`.
///
/// Used as an "idle" barrier: increment on every in-flight operation,
/// decrement on completion, wait for the target (usually 0).
#[derive(Clone)]
pub struct CounterWaiter {
    inner: Arc<Mutex<CounterInner>>,
}

struct CounterInner {
    counter: usize,
    target: usize,
    pending: Pending<Reply<usize, std::convert::Infallible>>,
}

impl CounterInner {
    fn settle(&mut self) {
        if self.counter != self.target {
            return;
        }
        let counter = self.counter;
        for tx in self.pending.drain() {
            let _ = tx.send(Ok(counter));
        }
    }
}

impl Default for CounterWaiter {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl CounterWaiter {
    pub fn new(counter: usize, target: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CounterInner {
                counter,
                target,
                pending: Pending::new(),
            })),
        }
    }

    pub fn counter(&self) -> usize {
        self.inner.lock().counter
    }

    pub fn target(&self) -> usize {
        self.inner.lock().target
    }

    pub fn is_reached(&self) -> bool {
        let inner = self.inner.lock();
        inner.counter == inner.target
    }

    pub fn inc(&self) {
        self.update(|inner| inner.counter += 1);
    }

    pub fn dec(&self) {
        self.update(|inner| inner.counter = inner.counter.saturating_sub(1));
    }

    pub fn set_counter(&self, counter: usize) {
        self.update(|inner| inner.counter = counter);
    }

    pub fn inc_target(&self) {
        self.update(|inner| inner.target += 1);
    }

    pub fn dec_target(&self) {
        self.update(|inner| inner.target = inner.target.saturating_sub(1));
    }

    pub fn set_target(&self, target: usize) {
        self.update(|inner| inner.target = target);
    }

    fn update(&self, f: impl FnOnce(&mut CounterInner)) {
        let mut inner = self.inner.lock();
        f(&mut inner);
        inner.settle();
    }

    pub fn wait(&self, timeout: Duration) -> Wait<usize> {
        let mut inner = self.inner.lock();
        if inner.counter == inner.target {
            return ready(Ok(inner.counter));
        }
        let (tx, rx) = oneshot::channel();
        let id = inner.pending.insert(tx);
        drop(inner);

        let state = Arc::clone(&self.inner);
        deferred(rx, timeout, move || {
            state.lock().pending.remove(id);
        })
    }

    pub fn waiting(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
