//! Waiters - タイムアウト付きの待ち合わせ
//!
//! 4 種類の待ち方を提供する。どれも
//! - 同時に何本でも `wait()` できる
//! - `wait()` はその場で登録され、返り値の future は `'static`（self を借用しない）
//! - タイムアウトは `wait()` の時点から数える。期限切れか drop で内部の追跡から自分を取り除く（リークしない）
//! - 先に解決した場合はタイマーごと drop される
//!
//! # 種類
//! - **PassiveWaiter**: 一度だけ確定する成功/失敗
//! - **AssignWaiter**: 値が `Some` になるのを待つ
//! - **CounterWaiter**: counter == target を待つ
//! - **ValueWaiter**: 値が good / bad 集合に入るのを待つ（MoodWaiter はこれ）

mod assign;
mod counter;
mod passive;
mod value;

pub use assign::AssignWaiter;
pub use counter::CounterWaiter;
pub use passive::PassiveWaiter;
pub use value::{MoodWaiter, ValueWaiter};

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Future returned by every `wait()`.
pub type Wait<T, E = Infallible> = Pin<Box<dyn Future<Output = Result<T, WaitError<E>>> + Send>>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WaitError<E = Infallible> {
    #[error("wait timed out after {0:?}")]
    Timeout(Duration),

    #[error("wait failed: {0:?}")]
    Failed(E),

    #[error("waiter was dropped before it resolved")]
    Dropped,
}

impl<E> WaitError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitError::Timeout(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("waiter was already resolved")]
    AlreadyResolved,
}

/// Registered waiters of one primitive, keyed by a per-instance id.
struct Pending<S> {
    next_id: u64,
    slots: HashMap<u64, S>,
}

impl<S> Pending<S> {
    fn new() -> Self {
        Self {
            next_id: 0,
            slots: HashMap::new(),
        }
    }

    fn insert(&mut self, slot: S) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(id, slot);
        id
    }

    fn remove(&mut self, id: u64) -> Option<S> {
        self.slots.remove(&id)
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn drain(&mut self) -> impl Iterator<Item = S> + '_ {
        self.slots.drain().map(|(_, slot)| slot)
    }
}

type Reply<T, E> = oneshot::Sender<Result<T, WaitError<E>>>;

fn ready<T, E>(result: Result<T, WaitError<E>>) -> Wait<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    Box::pin(std::future::ready(result))
}

/// Await `rx` until `timeout` after registration.
///
/// `forget` drops the registration once the future ends without a result,
/// whether by timing out or by being dropped unpolled.
fn deferred<T, E>(
    rx: oneshot::Receiver<Result<T, WaitError<E>>>,
    timeout: Duration,
    forget: impl FnOnce() + Send + 'static,
) -> Wait<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let now = Instant::now();
    let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);
    let mut guard = Forget(Some(forget));
    Box::pin(async move {
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => {
                guard.disarm();
                result
            }
            Ok(Err(_)) => Err(WaitError::Dropped),
            Err(_) => Err(WaitError::Timeout(timeout)),
        }
    })
}

/// Runs the deregistration on drop unless disarmed.
struct Forget<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Forget<F> {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl<F: FnOnce()> Drop for Forget<F> {
    fn drop(&mut self) {
        if let Some(forget) = self.0.take() {
            forget();
        }
    }
}
