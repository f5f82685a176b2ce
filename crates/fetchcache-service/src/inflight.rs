//! Deduplication of concurrent fetches.
//!
//! The [`InFlightRegistry`] maps every [`CacheKey`] that is currently being fetched to a
//! [`PendingFetch`]. Every caller interested in the result holds a [`Waiter`], and all waiters of
//! one fetch receive a clone of the same result.
//!
//! Interest is tracked per caller. A caller can retract its interest by dropping its [`Waiter`]
//! or through a [`CancelHandle`], and receives [`CacheError::Cancelled`]. Once the last caller
//! retracted its interest, the [`CancellationToken`] of the fetch is triggered, which aborts the
//! underlying work.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheContents, CacheError, CacheKey};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Slot = (u64, oneshot::Sender<CacheContents>);

#[derive(Debug, Default)]
struct Waiters {
    next_id: u64,
    slots: Vec<Slot>,
    done: bool,
}

/// A fetch that is currently running, along with everyone waiting for it.
#[derive(Debug)]
pub struct PendingFetch {
    key: CacheKey,
    waiters: Mutex<Waiters>,
    token: CancellationToken,
}

impl PendingFetch {
    fn new(key: CacheKey) -> Self {
        Self {
            key,
            waiters: Mutex::default(),
            token: CancellationToken::new(),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The token that is cancelled once no caller is interested anymore.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The number of callers currently waiting.
    pub fn waiter_count(&self) -> usize {
        lock(&self.waiters).slots.len()
    }

    fn push(self: &Arc<Self>, waiters: &mut Waiters) -> Waiter {
        let (sender, receiver) = oneshot::channel();
        let id = waiters.next_id;
        waiters.next_id += 1;
        waiters.slots.push((id, sender));

        Waiter {
            pending: Arc::clone(self),
            id,
            receiver,
            completed: false,
        }
    }

    /// Adds a caller, unless the fetch has already finished or was cancelled.
    fn attach(self: &Arc<Self>) -> Option<Waiter> {
        let mut waiters = lock(&self.waiters);
        if waiters.done || self.token.is_cancelled() {
            return None;
        }
        Some(self.push(&mut waiters))
    }

    /// Adds the very first caller.
    fn first_waiter(self: &Arc<Self>) -> Waiter {
        let mut waiters = lock(&self.waiters);
        self.push(&mut waiters)
    }

    fn retract_where(&self, select: impl FnOnce(&[Slot]) -> Option<usize>) -> bool {
        let mut waiters = lock(&self.waiters);
        let Some(index) = select(&waiters.slots) else {
            return false;
        };

        let (id, sender) = waiters.slots.remove(index);
        tracing::trace!("Caller {} retracted interest in `{}`", id, self.key);
        sender.send(Err(CacheError::Cancelled)).ok();

        if waiters.slots.is_empty() && !waiters.done {
            tracing::debug!("Cancelling fetch for `{}`", self.key);
            self.token.cancel();
        }
        true
    }

    /// Retracts the interest of caller `id`, returning whether it was still waiting.
    fn retract(&self, id: u64) -> bool {
        self.retract_where(|slots| slots.iter().position(|(slot, _)| *slot == id))
    }

    /// Retracts the interest of the caller that attached last.
    fn retract_latest(&self) -> bool {
        self.retract_where(|slots| slots.len().checked_sub(1))
    }

    /// Sends `result` to every caller still waiting, returning how many there were.
    fn finish(&self, result: CacheContents) -> usize {
        let mut waiters = lock(&self.waiters);
        waiters.done = true;

        let slots = std::mem::take(&mut waiters.slots);
        let notified = slots.len();
        for (_, sender) in slots {
            // the receiver might be gone already, which is fine
            sender.send(result.clone()).ok();
        }
        notified
    }
}

/// The interest of one caller in a [`PendingFetch`].
///
/// This resolves to the result of the fetch, or to [`CacheError::Cancelled`] if the interest was
/// retracted. Dropping it before completion retracts the interest.
#[derive(Debug)]
pub struct Waiter {
    pending: Arc<PendingFetch>,
    id: u64,
    receiver: oneshot::Receiver<CacheContents>,
    completed: bool,
}

impl Waiter {
    pub fn pending(&self) -> &Arc<PendingFetch> {
        &self.pending
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            target: Some((Arc::clone(&self.pending), self.id)),
        }
    }
}

impl Future for Waiter {
    type Output = CacheContents;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(result) => {
                this.completed = true;
                // a dropped sender means the fetch went away without a result
                Poll::Ready(result.unwrap_or(Err(CacheError::Cancelled)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if !self.completed {
            self.pending.retract(self.id);
        }
    }
}

/// A handle to retract the interest of a single caller in a fetch.
///
/// The caller receives [`CacheError::Cancelled`]. The fetch itself is only aborted once no other
/// caller is interested anymore.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    target: Option<(Arc<PendingFetch>, u64)>,
}

impl CancelHandle {
    /// A handle for a fetch that already completed, cancelling it has no effect.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Retracts the interest of the caller, returning whether it was still waiting.
    pub fn cancel(&self) -> bool {
        match &self.target {
            Some((pending, id)) => pending.retract(*id),
            None => false,
        }
    }
}

/// Synchronized map of all running fetches.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    inner: Mutex<HashMap<CacheKey, Arc<PendingFetch>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the running fetch of `key`, or registers a new one.
    ///
    /// Returns `true` if a new fetch was registered, in which case the caller is responsible for
    /// running it and calling [`complete`](Self::complete) eventually. Checking for a running
    /// fetch and registering a new one happens atomically.
    pub fn begin_or_join(&self, key: &CacheKey) -> (bool, Waiter) {
        let mut inner = lock(&self.inner);

        if let Some(waiter) = inner.get(key).and_then(|pending| pending.attach()) {
            tracing::trace!("Joining running fetch for `{}`", key);
            return (false, waiter);
        }

        // there is either no fetch, or one that finished or was cancelled, which is replaced
        let pending = Arc::new(PendingFetch::new(key.clone()));
        let waiter = pending.first_waiter();
        inner.insert(key.clone(), pending);
        (true, waiter)
    }

    /// Creates a fetch that is not registered and can thus not be joined.
    pub fn detached(&self, key: &CacheKey) -> Waiter {
        Arc::new(PendingFetch::new(key.clone())).first_waiter()
    }

    /// Finishes `pending`, notifying everyone waiting for it with the same `result`.
    ///
    /// Returns the number of notified callers.
    pub fn complete(&self, pending: &Arc<PendingFetch>, result: CacheContents) -> usize {
        {
            let mut inner = lock(&self.inner);
            if inner
                .get(pending.key())
                .is_some_and(|registered| Arc::ptr_eq(registered, pending))
            {
                inner.remove(pending.key());
            }
        }
        pending.finish(result)
    }

    /// Retracts the interest of the caller that most recently joined the fetch of `key`.
    ///
    /// Returns `false` if there is no running fetch for `key`.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        let pending = lock(&self.inner).get(key).cloned();
        match pending {
            Some(pending) => pending.retract_latest(),
            None => false,
        }
    }

    /// The number of running fetches.
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
