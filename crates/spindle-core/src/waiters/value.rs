use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{Pending, Reply, Wait, WaitError, deferred, ready};
use crate::domain::Mood;

/// Mood of a remote component, waited on as a value.
pub type MoodWaiter = ValueWaiter<Mood>;

/// Holds a current value and resolves waiters when it enters a set.
///
/// `wait(good, bad, ..)`:
/// - value in `good` → `Ok(value)`
/// - value in `bad` → `Err(Failed(value))`
/// - both empty → resolves on the next change, whatever it is
///
/// Setting a value equal to the current one is not a change.
pub struct ValueWaiter<V> {
    inner: Arc<Mutex<ValueInner<V>>>,
}

struct Watch<V> {
    good: Vec<V>,
    bad: Vec<V>,
    tx: Reply<V, V>,
}

impl<V: PartialEq + Clone> Watch<V> {
    fn outcome(&self, value: &V) -> Option<Result<V, WaitError<V>>> {
        if self.good.is_empty() && self.bad.is_empty() {
            return Some(Ok(value.clone()));
        }
        if self.good.contains(value) {
            Some(Ok(value.clone()))
        } else if self.bad.contains(value) {
            Some(Err(WaitError::Failed(value.clone())))
        } else {
            None
        }
    }
}

struct ValueInner<V> {
    value: V,
    pending: Pending<Watch<V>>,
}

impl<V> Clone for ValueWaiter<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> ValueWaiter<V>
where
    V: PartialEq + Clone + Send + 'static,
{
    pub fn new(initial: V) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ValueInner {
                value: initial,
                pending: Pending::new(),
            })),
        }
    }

    pub fn value(&self) -> V {
        self.inner.lock().value.clone()
    }

    /// Returns `true` when the value actually changed.
    pub fn set_value(&self, value: V) -> bool {
        let mut inner = self.inner.lock();
        if inner.value == value {
            return false;
        }

        let settled: Vec<u64> = inner
            .pending
            .slots
            .iter()
            .filter(|(_, watch)| watch.outcome(&value).is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in settled {
            if let Some(watch) = inner.pending.remove(id)
                && let Some(outcome) = watch.outcome(&value)
            {
                let _ = watch.tx.send(outcome);
            }
        }

        inner.value = value;
        true
    }

    pub fn wait(&self, good: &[V], bad: &[V], timeout: Duration) -> Wait<V, V> {
        let mut inner = self.inner.lock();
        let unconditional = good.is_empty() && bad.is_empty();
        if !unconditional {
            if good.contains(&inner.value) {
                return ready(Ok(inner.value.clone()));
            }
            if bad.contains(&inner.value) {
                return ready(Err(WaitError::Failed(inner.value.clone())));
            }
        }

        let (tx, rx) = oneshot::channel();
        let id = inner.pending.insert(Watch {
            good: good.to_vec(),
            bad: bad.to_vec(),
            tx,
        });
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn good_value_resolves() {
        let mood = MoodWaiter::new(Mood::Waking);
        let wait = mood.wait(&[Mood::Happy], &[Mood::Sad], Duration::from_secs(5));

        mood.set_value(Mood::Sleeping);
        assert_eq!(mood.waiting(), 1);
        mood.set_value(Mood::Happy);

        assert_eq!(wait.await.unwrap(), Mood::Happy);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_value_fails() {
        let mood = MoodWaiter::new(Mood::Waking);
        let wait = mood.wait(&[Mood::Happy], &[Mood::Sad, Mood::Lost], Duration::from_secs(5));
        mood.set_value(Mood::Lost);

        assert_eq!(wait.await.unwrap_err(), WaitError::Failed(Mood::Lost));
    }

    #[tokio::test(start_paused = true)]
    async fn current_value_short_circuits() {
        let mood = MoodWaiter::new(Mood::Happy);
        let got = mood
            .wait(&[Mood::Happy], &[], Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(got, Mood::Happy);
    }

    #[tokio::test(start_paused = true)]
    async fn unconditional_waits_for_a_real_change() {
        let mood = MoodWaiter::new(Mood::Sad);
        let wait = mood.wait(&[], &[], Duration::from_secs(5));

        assert!(!mood.set_value(Mood::Sad));
        assert_eq!(mood.waiting(), 1);
        assert!(mood.set_value(Mood::Happy));

        assert_eq!(wait.await.unwrap(), Mood::Happy);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_nothing_behind() {
        let mood = MoodWaiter::new(Mood::Sleeping);
        let err = mood
            .wait(&[Mood::Happy], &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(mood.waiting(), 0);
    }
}
