use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{Pending, Reply, Wait, deferred, ready};

/// Holds an optional value; `wait()` resolves as soon as it is `Some`.
pub struct AssignWaiter<T> {
    inner: Arc<Mutex<AssignInner<T>>>,
}

struct AssignInner<T> {
    value: Option<T>,
    pending: Pending<Reply<T, std::convert::Infallible>>,
}

impl<T> Clone for AssignWaiter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> AssignWaiter<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(initial: Option<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AssignInner {
                value: initial,
                pending: Pending::new(),
            })),
        }
    }

    pub fn value(&self) -> Option<T> {
        self.inner.lock().value.clone()
    }

    pub fn set_value(&self, value: Option<T>) {
        let mut inner = self.inner.lock();
        if let Some(v) = &value {
            for tx in inner.pending.drain() {
                let _ = tx.send(Ok(v.clone()));
            }
        }
        inner.value = value;
    }

    pub fn wait(&self, timeout: Duration) -> Wait<T> {
        let mut inner = self.inner.lock();
        if let Some(v) = &inner.value {
            return ready(Ok(v.clone()));
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
