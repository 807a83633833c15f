//! Reconnecting client for long-lived consumers such as editors.
//!
//! Wraps [`Client`] with a connection state machine and exponential backoff.
//! Events from every underlying connection are forwarded into one channel
//! that outlives reconnects, and the last `watch/start` is replayed after a
//! reconnect so the consumer keeps receiving events.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::client::{Client, DEFAULT_CONNECT_TIMEOUT, EVENT_BUFFER};
use super::protocol::*;
use crate::error::{BazelleError, Result};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// `initial * multiplier^attempt`, capped at `max_delay`. Attempts count from 0.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Clone)]
pub struct ReconnectingClient {
    inner: Arc<Inner>,
}

struct Inner {
    socket: PathBuf,
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
    policy: ReconnectPolicy,
    state: Mutex<ConnectionState>,
    state_changed: Condvar,
    client: Mutex<Option<Arc<Client>>>,
    last_watch: Mutex<Option<WatchStartParams>>,
    events_tx: SyncSender<Notification>,
    events_rx: Mutex<Option<Receiver<Notification>>>,
    /// Identifies the live connection; monitors of older ones stay quiet.
    generation: AtomicU64,
    closed: AtomicBool,
}

impl ReconnectingClient {
    pub fn new(socket: &Path, policy: ReconnectPolicy) -> Self {
        Self::with_timeouts(socket, policy, DEFAULT_CONNECT_TIMEOUT, None)
    }

    pub fn with_timeouts(
        socket: &Path,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
        request_timeout: Option<Duration>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::sync_channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                socket: socket.to_path_buf(),
                connect_timeout,
                request_timeout,
                policy,
                state: Mutex::new(ConnectionState::Disconnected),
                state_changed: Condvar::new(),
                client: Mutex::new(None),
                last_watch: Mutex::new(None),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    /// Block until the state equals `target` or `timeout` passes.
    pub fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.inner.state);
        while *state != target {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.inner.state_changed.wait_timeout(state, deadline - now) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// The event stream across all connections. Returns `Some` once.
    pub fn events(&self) -> Option<Receiver<Notification>> {
        lock(&self.inner.events_rx).take()
    }

    /// First connection. Fails instead of retrying.
    pub fn connect(&self) -> Result<()> {
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Connecting);
        if let Err(e) = Inner::establish(&self.inner) {
            self.inner.set_state(ConnectionState::Disconnected);
            return Err(e);
        }
        Ok(())
    }

    /// Retry with backoff until connected or the policy gives up.
    pub fn reconnect(&self) -> Result<()> {
        Inner::reconnect(&self.inner)
    }

    pub fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.current()?.call(method, params)
    }

    pub fn ping(&self) -> Result<PingResult> {
        self.current()?.ping()
    }

    /// Remembered and replayed after every reconnect.
    pub fn watch_start(&self, params: &WatchStartParams) -> Result<WatchStartResult> {
        let result = self.current()?.watch_start(params)?;
        *lock(&self.inner.last_watch) = Some(params.clone());
        Ok(result)
    }

    pub fn watch_stop(&self) -> Result<WatchStopResult> {
        *lock(&self.inner.last_watch) = None;
        self.current()?.watch_stop()
    }

    pub fn watch_status(&self) -> Result<WatchStatusResult> {
        self.current()?.watch_status()
    }

    pub fn update_run(&self, params: &UpdateRunParams) -> Result<UpdateRunResult> {
        self.current()?.update_run(params)
    }

    pub fn status_get(&self, params: &StatusGetParams) -> Result<StatusGetResult> {
        self.current()?.status_get(params)
    }

    /// Disconnect for good; no reconnect follows.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(client) = lock(&self.inner.client).take() {
            client.close();
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    fn current(&self) -> Result<Arc<Client>> {
        lock(&self.inner.client)
            .clone()
            .ok_or(BazelleError::NotConnected)
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!(from = ?*state, to = ?next, "connection state");
            *state = next;
        }
        self.state_changed.notify_all();
    }

    /// Connect, subscribe and hand the event stream to a monitor thread.
    fn establish(this: &Arc<Self>) -> Result<()> {
        let client = Client::connect(&this.socket, this.connect_timeout)?
            .with_request_timeout(this.request_timeout);
        let events = client
            .subscribe_events()?
            .ok_or(BazelleError::NotConnected)?;
        let client = Arc::new(client);

        let generation = this.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&this.client) = Some(Arc::clone(&client));
        this.set_state(ConnectionState::Connected);

        let monitor = Arc::clone(this);
        thread::Builder::new()
            .name("bazelle-reconnect".to_string())
            .spawn(move || monitor.monitor(events, generation))?;
        Ok(())
    }

    fn monitor(self: Arc<Self>, events: Receiver<Notification>, generation: u64) {
        for note in events.iter() {
            self.forward(note);
        }
        if self.closed.load(Ordering::SeqCst)
            || self.generation.load(Ordering::SeqCst) != generation
        {
            return;
        }
        warn!(socket = %self.socket.display(), "connection to daemon lost");
        if let Err(e) = Inner::reconnect(&self) {
            warn!(error = %e, "reconnect failed");
        }
    }

    /// Never blocks: a consumer that stops reading loses new events.
    fn forward(&self, note: Notification) {
        if let Err(TrySendError::Full(_)) = self.events_tx.try_send(note) {
            debug!("event buffer full, dropping notification");
        }
    }

    fn reconnect(this: &Arc<Self>) -> Result<()> {
        this.set_state(ConnectionState::Reconnecting);
        if let Some(old) = lock(&this.client).take() {
            old.close();
        }

        let attempts = this.policy.max_attempts;
        for attempt in 0..attempts {
            if this.sleep_unless_closed(this.policy.backoff_delay(attempt)) {
                return Err(BazelleError::NotConnected);
            }
            match Inner::establish(this) {
                Ok(()) => {
                    info!(attempt = attempt + 1, "reconnected to daemon");
                    this.replay_watch();
                    return Ok(());
                }
                Err(e) => debug!(attempt = attempt + 1, error = %e, "reconnect attempt failed"),
            }
        }

        this.set_state(ConnectionState::Disconnected);
        Err(BazelleError::ReconnectFailed { attempts })
    }

    fn replay_watch(&self) {
        let params = lock(&self.last_watch).clone();
        let client = lock(&self.client).clone();
        if let (Some(params), Some(client)) = (params, client) {
            match client.watch_start(&params) {
                Ok(result) => debug!(status = %result.status, "watch replayed"),
                Err(e) => warn!(error = %e, "failed to replay watch/start"),
            }
        }
    }

    /// Sleep for `delay`; returns true early if the client was closed.
    fn sleep_unless_closed(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(20)));
        }
    }
}
