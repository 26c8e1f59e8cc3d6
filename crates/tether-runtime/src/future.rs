//! One-shot asynchronous results.
//!
//! A [`Promise`] is the single writer and a [`Future`] one of many readers
//! of the same shared state. The state moves from pending to exactly one of
//! value, error or canceled, and never changes again. Readers can block
//! with [`Future::wait`], `.await` the future, or chain work with
//! [`Future::then`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tether_types::{DynamicValue, Error, FromValue, Result};

type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

/// Result of a bounded [`Future::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Settled with a value.
    Ready,
    /// Settled with an error, cancellation included.
    Failed,
    /// Still pending when the timeout elapsed.
    TimedOut,
}

struct State<T> {
    outcome: Option<Result<T>>,
    wakers: Vec<Waker>,
    callbacks: Vec<Callback<T>>,
    on_cancel: Option<CancelHook>,
    cancel_requested: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    settled: Condvar,
    /// Live promise handles; the last one dropped unsettled breaks the promise.
    writers: AtomicUsize,
}

fn lock<S>(m: &Mutex<S>) -> MutexGuard<'_, S> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T: Clone + Send + 'static> Shared<T> {
    fn new(writers: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                outcome: None,
                wakers: Vec::new(),
                callbacks: Vec::new(),
                on_cancel: None,
                cancel_requested: false,
            }),
            settled: Condvar::new(),
            writers: AtomicUsize::new(writers),
        })
    }

    fn settle(&self, outcome: Result<T>) -> Result<()> {
        let (wakers, callbacks, unused_hook) = {
            let mut state = lock(&self.state);
            if state.outcome.is_some() {
                return Err(Error::PromiseAlreadySettled);
            }
            state.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut state.wakers),
                std::mem::take(&mut state.callbacks),
                state.on_cancel.take(),
            )
        };
        // The hook may own a promise handle; drop it outside the lock.
        drop(unused_hook);
        self.settled.notify_all();
        for waker in wakers {
            waker.wake();
        }
        // Continuations run on the settling thread, outside the lock.
        for callback in callbacks {
            callback(&outcome);
        }
        Ok(())
    }
}

/// Write side of a one-shot result.
///
/// Clones share the same slot. When the last clone is dropped without
/// settling, readers observe [`Error::BrokenPromise`].
pub struct Promise<T: Clone + Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub fn new() -> Self {
        Self {
            shared: Shared::new(1),
        }
    }

    /// A reader for this promise's result.
    pub fn future(&self) -> Future<T> {
        Future {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn set_value(&self, value: T) -> Result<()> {
        self.shared.settle(Ok(value))
    }

    pub fn set_error(&self, error: Error) -> Result<()> {
        self.shared.settle(Err(error))
    }

    pub fn set_canceled(&self) -> Result<()> {
        self.shared.settle(Err(Error::Canceled))
    }

    /// Settle with whatever `outcome` holds.
    pub fn settle(&self, outcome: Result<T>) -> Result<()> {
        self.shared.settle(outcome)
    }

    pub fn is_settled(&self) -> bool {
        lock(&self.shared.state).outcome.is_some()
    }

    /// True once a reader asked for cancellation.
    pub fn is_cancel_requested(&self) -> bool {
        lock(&self.shared.state).cancel_requested
    }

    /// Install the hook run when a reader requests cancellation.
    ///
    /// If cancellation was already requested the hook runs immediately. The
    /// hook is dropped unused once the promise settles.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut state = lock(&self.shared.state);
            if state.outcome.is_some() {
                return;
            }
            if !state.cancel_requested {
                state.on_cancel = Some(Box::new(hook));
                return;
            }
        }
        hook();
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        self.shared.writers.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.shared.writers.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = self.shared.settle(Err(Error::BrokenPromise));
        }
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Read side of a one-shot result. Cheap to clone; every clone observes
/// the same outcome.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// An already-resolved future.
    pub fn ready(value: T) -> Self {
        let shared = Shared::new(0);
        let _ = shared.settle(Ok(value));
        Self { shared }
    }

    /// An already-rejected future.
    pub fn failed(error: Error) -> Self {
        let shared = Shared::new(0);
        let _ = shared.settle(Err(error));
        Self { shared }
    }

    /// The outcome, if settled.
    pub fn peek(&self) -> Option<Result<T>> {
        lock(&self.shared.state).outcome.clone()
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.shared.state).outcome.is_some()
    }

    pub fn has_value(&self) -> bool {
        matches!(lock(&self.shared.state).outcome, Some(Ok(_)))
    }

    pub fn has_error(&self) -> bool {
        matches!(lock(&self.shared.state).outcome, Some(Err(_)))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(lock(&self.shared.state).outcome, Some(Err(Error::Canceled)))
    }

    /// Block the calling thread until settled or until `timeout` elapses.
    ///
    /// `None` waits without bound. Never call this from a handler that the
    /// awaited result depends on.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&self.shared.state);
        while state.outcome.is_none() {
            match deadline {
                None => {
                    state = self
                        .shared
                        .settled
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    let (guard, _) = self
                        .shared
                        .settled
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    state = guard;
                }
            }
        }
        match state.outcome {
            Some(Ok(_)) => WaitOutcome::Ready,
            _ => WaitOutcome::Failed,
        }
    }

    /// Block for the outcome; an elapsed timeout yields [`Error::TimedOut`].
    pub fn value(&self, timeout: Option<Duration>) -> Result<T> {
        match self.wait(timeout) {
            WaitOutcome::TimedOut => Err(Error::TimedOut),
            _ => self.peek().unwrap_or(Err(Error::BrokenPromise)),
        }
    }

    /// Run `callback` exactly once with the outcome.
    ///
    /// Runs immediately on the calling thread when already settled,
    /// otherwise on whichever thread settles the promise.
    pub fn on_settled(&self, callback: impl FnOnce(&Result<T>) + Send + 'static) {
        let outcome = {
            let mut state = lock(&self.shared.state);
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&outcome);
    }

    /// Chain a continuation, producing a future for its result.
    ///
    /// Cancelling the returned future forwards the request to this one.
    pub fn then<U, F>(&self, continuation: F) -> Future<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Result<T>) -> Result<U> + Send + 'static,
    {
        let promise = Promise::new();
        let derived = promise.future();
        let source = self.clone();
        promise.on_cancel(move || source.cancel_request());
        self.on_settled(move |outcome| {
            let _ = promise.settle(continuation(outcome.clone()));
        });
        derived
    }

    /// Ask the producer to cancel. Advisory: the state only changes when
    /// the producer settles the promise.
    pub fn cancel_request(&self) {
        let hook = {
            let mut state = lock(&self.shared.state);
            if state.outcome.is_some() || state.cancel_requested {
                return;
            }
            state.cancel_requested = true;
            state.on_cancel.take()
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl Future<DynamicValue> {
    /// Convert the eventual value to a native type.
    pub fn typed<U>(&self) -> Future<U>
    where
        U: FromValue + Clone + Send + 'static,
    {
        self.then(|outcome| outcome?.into_native::<U>())
    }
}

impl<T: Clone + Send + 'static> std::future::Future for Future<T> {
    type Output = Result<T>;

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = lock(&self.shared.state);
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("finished", &self.is_finished())
            .finish()
    }
}
