use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{Pending, Reply, ResolveError, Wait, WaitError, deferred, ready};

/// Records a single terminal outcome.
///
/// Every `wait()` after resolution returns that outcome immediately. Resolving
/// twice is a programming error and is reported as `AlreadyResolved`.
pub struct PassiveWaiter<T, E> {
    inner: Arc<Mutex<PassiveInner<T, E>>>,
}

struct PassiveInner<T, E> {
    outcome: Option<Result<T, E>>,
    pending: Pending<Reply<T, E>>,
}

impl<T, E> Clone for PassiveWaiter<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Default for PassiveWaiter<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> PassiveWaiter<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PassiveInner {
                outcome: None,
                pending: Pending::new(),
            })),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.lock().outcome.is_some()
    }

    pub fn resolve(&self, value: T) -> Result<(), ResolveError> {
        self.settle(Ok(value))
    }

    pub fn fail(&self, error: E) -> Result<(), ResolveError> {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Result<T, E>) -> Result<(), ResolveError> {
        let mut inner = self.inner.lock();
        if inner.outcome.is_some() {
            return Err(ResolveError::AlreadyResolved);
        }
        for tx in inner.pending.drain() {
            // 受信側が既に諦めていても構わない
            let _ = tx.send(outcome.clone().map_err(WaitError::Failed));
        }
        inner.outcome = Some(outcome);
        Ok(())
    }

    pub fn wait(&self, timeout: Duration) -> Wait<T, E> {
        let mut inner = self.inner.lock();
        if let Some(outcome) = &inner.outcome {
            return ready(outcome.clone().map_err(WaitError::Failed));
        }
        let (tx, rx) = oneshot::channel();
        let id = inner.pending.insert(tx);
        drop(inner);

        let state = Arc::clone(&self.inner);
        deferred(rx, timeout, move || {
            state.lock().pending.remove(id);
        })
    }

    /// Number of callers currently queued.
    pub fn waiting(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn resolves_every_queued_waiter() {
        let waiter: PassiveWaiter<u32, String> = PassiveWaiter::new();
        let a = waiter.wait(Duration::from_secs(5));
        let b = waiter.wait(Duration::from_secs(5));
        assert_eq!(waiter.waiting(), 2);

        waiter.resolve(7).unwrap();

        assert_eq!(a.await.unwrap(), 7);
        assert_eq!(b.await.unwrap(), 7);
        assert_eq!(waiter.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_waiters_get_outcome_immediately() {
        let waiter: PassiveWaiter<(), String> = PassiveWaiter::new();
        waiter.fail("boom".to_string()).unwrap();

        let err = waiter.wait(Duration::from_millis(1)).await.unwrap_err();
        assert_eq!(err, WaitError::Failed("boom".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_forgets_the_waiter() {
        let waiter: PassiveWaiter<(), String> = PassiveWaiter::new();
        let wait = waiter.wait(Duration::from_secs(1));
        assert_eq!(waiter.waiting(), 1);

        let err = wait.await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(waiter.waiting(), 0);

        // 後から解決しても問題ない
        waiter.resolve(()).unwrap();
    }

    #[test]
    fn double_resolution_fails_fast() {
        let waiter: PassiveWaiter<u32, String> = PassiveWaiter::new();
        waiter.resolve(1).unwrap();
        assert_eq!(waiter.resolve(2), Err(ResolveError::AlreadyResolved));
        assert_eq!(waiter.fail("x".into()), Err(ResolveError::AlreadyResolved));
    }
}
