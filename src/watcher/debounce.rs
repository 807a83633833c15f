//! Debouncer — coalesces bursts of directory notifications.
//!
//! Every [`Debouncer::add`] re-arms a one-shot timer; only the last call in
//! a burst starts the timer that fires. When the pending set reaches its cap
//! the timer is cancelled and the batch is flushed at once.
//!
//! Batches are handed to the callback with the state lock released, so the
//! callback may call back into the debouncer. Callbacks never overlap: a
//! second lock serializes delivery, and batches queue up in FIFO order while
//! one is being delivered.

use std::collections::{BTreeSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Hard cap on pending directories before an early flush.
pub const DEFAULT_MAX_PENDING_DIRS: usize = 1000;

type FlushCallback = Box<dyn Fn(Vec<String>) + Send + Sync>;

/// Cheap to clone; all clones drive the same timer.
#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<Inner>,
}

struct Inner {
    window: Duration,
    max_pending: usize,
    callback: FlushCallback,
    state: Mutex<State>,
    wake: Condvar,
    /// Held for the duration of a delivery.
    delivering: Mutex<()>,
    /// Thread currently inside the callback, if any.
    deliverer: Mutex<Option<ThreadId>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct State {
    pending: BTreeSet<String>,
    deadline: Option<Instant>,
    queued: VecDeque<Vec<String>>,
    stopped: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Debouncer {
    /// Start a debouncer with its timer thread. `callback` receives the
    /// sorted, deduplicated directories of each batch.
    pub fn new<F>(window: Duration, max_pending: usize, callback: F) -> Self
    where
        F: Fn(Vec<String>) + Send + Sync + 'static,
    {
        let inner = Arc::new(Inner {
            window,
            max_pending: max_pending.max(1),
            callback: Box::new(callback),
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
            delivering: Mutex::new(()),
            deliverer: Mutex::new(None),
            timer: Mutex::new(None),
        });

        let timer_inner = Arc::clone(&inner);
        let handle = thread::spawn(move || timer_inner.run_timer());
        *lock(&inner.timer) = Some(handle);

        Self { inner }
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Record a changed directory and re-arm the timer.
    pub fn add(&self, dir: impl Into<String>) {
        let mut state = lock(&self.inner.state);
        if state.stopped {
            return;
        }
        state.pending.insert(dir.into());

        if state.pending.len() >= self.inner.max_pending {
            let batch = std::mem::take(&mut state.pending);
            state.deadline = None;
            state.queued.push_back(batch.into_iter().collect());
            drop(state);
            debug!(cap = self.inner.max_pending, "pending cap reached, flushing early");
            self.inner.deliver();
        } else {
            state.deadline = Some(Instant::now() + self.inner.window);
            drop(state);
            self.inner.wake.notify_all();
        }
    }

    /// Flush whatever is pending right now, without waiting for the window.
    pub fn flush_now(&self) {
        {
            let mut state = lock(&self.inner.state);
            state.deadline = None;
            Inner::enqueue_pending(&mut state);
        }
        self.inner.deliver();
    }

    /// Flush one last time and ignore every later `add`.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.deadline = None;
            Inner::enqueue_pending(&mut state);
        }
        self.inner.wake.notify_all();
        self.inner.deliver();

        let handle = lock(&self.inner.timer).take();
        if let Some(handle) = handle {
            let current = thread::current().id();
            if handle.thread().id() != current && !self.inner.is_deliverer() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.inner.state).stopped
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }
}

impl Inner {
    fn enqueue_pending(state: &mut State) {
        if !state.pending.is_empty() {
            let batch = std::mem::take(&mut state.pending);
            state.queued.push_back(batch.into_iter().collect());
        }
    }

    fn is_deliverer(&self) -> bool {
        *lock(&self.deliverer) == Some(thread::current().id())
    }

    /// Drain queued batches through the callback. From inside the callback
    /// this only leaves the batch queued; the active delivery loop picks it up.
    fn deliver(&self) {
        let _guard = if self.is_deliverer() {
            match self.delivering.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(p)) => p.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            }
        } else {
            lock(&self.delivering)
        };

        *lock(&self.deliverer) = Some(thread::current().id());
        loop {
            let batch = lock(&self.state).queued.pop_front();
            let Some(batch) = batch else { break };
            if batch.is_empty() {
                continue;
            }
            debug!(dirs = batch.len(), "debounce flush");
            let result = panic::catch_unwind(AssertUnwindSafe(|| (self.callback)(batch)));
            if result.is_err() {
                error!("debounce callback panicked");
            }
        }
        *lock(&self.deliverer) = None;
    }

    fn run_timer(&self) {
        let mut state = lock(&self.state);
        loop {
            if !state.queued.is_empty() {
                drop(state);
                self.deliver();
                state = lock(&self.state);
                continue;
            }

            match state.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.deadline = None;
                        Inner::enqueue_pending(&mut state);
                        continue;
                    }
                    state = match self.wake.wait_timeout(state, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
                None if state.stopped => break,
                None => {
                    state = self.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        debug!("debounce timer exited");
    }
}
