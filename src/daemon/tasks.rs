//! Shutdown signalling and thread bookkeeping for the server.

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One-shot cancellation token shared by every shutdown trigger: the
/// caller, OS signals and the `shutdown` RPC.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
    triggered: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Only the first caller gets `true`.
    pub fn trigger(&self) -> bool {
        if self
            .inner
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let _guard = lock(&self.inner.lock);
        self.inner.cond.notify_all();
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Block until triggered.
    pub fn wait(&self) {
        let mut guard = lock(&self.inner.lock);
        while !self.is_triggered() {
            guard = self
                .inner
                .cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until triggered or `timeout` passes. Returns whether it fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = lock(&self.inner.lock);
        while !self.is_triggered() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.inner.cond.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

/// Route SIGTERM and SIGINT into `signal`. Close the returned handle to
/// stop listening.
pub fn forward_os_signals(signal: ShutdownSignal) -> io::Result<Handle> {
    let mut signals = Signals::new([SIGTERM, SIGINT])?;
    let handle = signals.handle();

    thread::Builder::new()
        .name("bazelle-signals".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!(signal = sig, "termination signal received");
                signal.trigger();
            }
        })?;

    Ok(handle)
}

/// Counts live threads so shutdown can wait for them.
#[derive(Debug, Clone, Default)]
pub struct TaskGroup {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

/// Decrements the group on drop, including when the task panics.
struct TaskGuard(TaskGroup);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let (count, cond) = &*self.0.inner;
        let mut n = lock(count);
        *n = n.saturating_sub(1);
        cond.notify_all();
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a named thread counted by this group.
    pub fn spawn<F>(&self, name: &str, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        *lock(&self.inner.0) += 1;
        let guard = TaskGuard(self.clone());
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = guard;
                f();
            })?;
        Ok(())
    }

    pub fn active(&self) -> usize {
        *lock(&self.inner.0)
    }

    /// Wait for every task to finish. Returns false if `timeout` passed first.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (count, cond) = &*self.inner;
        let mut n = lock(count);
        while *n > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            n = match cond.wait_timeout(n, deadline - now) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}
