//! Request handler — method dispatch and watch state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::protocol::*;
use super::server::{ClientConn, ClientRegistry};
use super::tasks::ShutdownSignal;
use crate::app::App;
use crate::error::BazelleError;
use crate::incremental::ALL_TARGETS;
use crate::watcher::{EventSink, WatchOptions, Watcher};

/// Gap between answering `shutdown` and actually shutting down, so the
/// response reaches the caller before its socket closes.
pub const SHUTDOWN_DELAY: Duration = Duration::from_millis(100);

type RpcResult = std::result::Result<Value, RpcError>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_result<T: Serialize>(value: T) -> RpcResult {
    serde_json::to_value(value).map_err(|e| RpcError::internal_error(e.to_string()))
}

/// Caller mistakes become `InvalidParams`, everything else `InternalError`.
fn rpc_error(err: BazelleError) -> RpcError {
    match err {
        BazelleError::UnknownLanguage(_) | BazelleError::PathNotFound(_) => {
            RpcError::invalid_params(err.to_string())
        }
        other => RpcError::internal_error(other.to_string()),
    }
}

#[derive(Default)]
struct WatchState {
    watching: bool,
    /// Set by `Handler::stop`; no watcher may start afterwards.
    closed: bool,
    paths: Vec<String>,
    languages: Vec<String>,
    update_count: u64,
    last_update: Option<DateTime<Utc>>,
    /// Identifies the installed watcher so a stale exit hook cannot reset a newer session.
    session: u64,
    watcher: Option<Watcher>,
}

pub struct Handler {
    app: Arc<App>,
    registry: Arc<ClientRegistry>,
    signal: ShutdownSignal,
    started_at: DateTime<Utc>,
    started: Instant,
    watch: Arc<Mutex<WatchState>>,
    /// Serializes `update/run`.
    update_lock: Mutex<()>,
}

impl Handler {
    pub fn new(app: Arc<App>, registry: Arc<ClientRegistry>, signal: ShutdownSignal) -> Self {
        Self {
            app,
            registry,
            signal,
            started_at: Utc::now(),
            started: Instant::now(),
            watch: Arc::new(Mutex::new(WatchState::default())),
            update_lock: Mutex::new(()),
        }
    }

    /// Answer one request. Notifications never reach this point.
    pub fn handle(&self, request: &Request, conn: &Arc<ClientConn>) -> Response {
        let result = match request.method.as_str() {
            METHOD_PING => self.ping(),
            METHOD_SHUTDOWN => self.shutdown(),
            METHOD_WATCH_START => self.watch_start(request, conn),
            METHOD_WATCH_STOP => self.watch_stop(),
            METHOD_WATCH_STATUS => self.watch_status(),
            METHOD_UPDATE_RUN => self.update_run(request),
            METHOD_STATUS_GET => self.status_get(request),
            other => Err(RpcError::method_not_found(other)),
        };
        match result {
            Ok(value) => Response::success(request.id, value),
            Err(e) => {
                debug!(method = %request.method, code = e.code, message = %e.message, "request failed");
                Response::failure(request.id, e)
            }
        }
    }

    /// Cancel the active watcher and refuse new ones.
    pub fn stop(&self) {
        let watcher = {
            let mut state = lock(&self.watch);
            state.closed = true;
            state.watching = false;
            state.session += 1;
            state.watcher.take()
        };
        if let Some(mut watcher) = watcher {
            watcher.stop();
        }
    }

    pub fn is_watching(&self) -> bool {
        lock(&self.watch).watching
    }

    // ─── Methods ────────────────────────────────────────────────

    fn ping(&self) -> RpcResult {
        to_result(PingResult {
            pong: true,
            version: self.app.version.clone(),
            uptime: format_uptime(self.started.elapsed()),
            start_time: self.started_at.to_rfc3339(),
        })
    }

    fn shutdown(&self) -> RpcResult {
        info!("shutdown requested over RPC");
        let signal = self.signal.clone();
        let spawned = thread::Builder::new()
            .name("bazelle-shutdown".to_string())
            .spawn(move || {
                thread::sleep(SHUTDOWN_DELAY);
                signal.trigger();
            });
        if spawned.is_err() {
            self.signal.trigger();
        }
        to_result(ShutdownResult {
            message: "daemon shutting down".to_string(),
        })
    }

    fn watch_start(&self, request: &Request, conn: &Arc<ClientConn>) -> RpcResult {
        let params: WatchStartParams = request.parse_params()?;

        let session = {
            let mut state = lock(&self.watch);
            if state.closed {
                return Err(RpcError::internal_error("daemon is shutting down"));
            }
            if state.watching {
                conn.subscribe();
                return already_watching(&state);
            }
            state.session += 1;
            state.session
        };

        let paths = if params.paths.is_empty() {
            vec![".".to_string()]
        } else {
            params.paths
        };
        let debounce = if params.debounce_ms <= 0 {
            Duration::from_millis(self.app.config.daemon.debounce_ms)
        } else {
            Duration::from_millis(params.debounce_ms as u64)
        };
        let options = WatchOptions {
            paths: paths.clone(),
            languages: params.languages.clone(),
            debounce,
        };

        // May run a full scan; the state lock is not held.
        let mut watcher = Watcher::start(
            Arc::clone(&self.app),
            options,
            self.event_sink(),
            exit_hook(Arc::downgrade(&self.watch), session),
        )
        .map_err(rpc_error)?;

        let mut state = lock(&self.watch);
        if state.closed || state.watching {
            let reply = if state.closed {
                Err(RpcError::internal_error("daemon is shutting down"))
            } else {
                conn.subscribe();
                already_watching(&state)
            };
            drop(state);
            debug!(session, "concurrent watch start lost, stopping extra watcher");
            watcher.stop();
            return reply;
        }
        state.watching = true;
        state.session = session;
        state.paths = paths.clone();
        state.languages = params.languages.clone();
        state.update_count = 0;
        state.last_update = None;
        state.watcher = Some(watcher);
        drop(state);

        conn.subscribe();
        info!(?paths, debounce_ms = debounce.as_millis() as u64, "watch started");
        to_result(WatchStartResult {
            status: STATUS_STARTED.to_string(),
            paths,
            languages: params.languages,
        })
    }

    fn watch_stop(&self) -> RpcResult {
        let watcher = {
            let mut state = lock(&self.watch);
            if !state.watching {
                return to_result(WatchStopResult {
                    status: STATUS_NOT_WATCHING.to_string(),
                });
            }
            state.watching = false;
            state.session += 1;
            state.paths.clear();
            state.languages.clear();
            state.watcher.take()
        };
        // Joined without the state lock: the watcher's final flush reports through it.
        if let Some(mut watcher) = watcher {
            watcher.stop();
        }
        info!("watch stopped");
        to_result(WatchStopResult {
            status: STATUS_STOPPED.to_string(),
        })
    }

    fn watch_status(&self) -> RpcResult {
        let state = lock(&self.watch);
        to_result(WatchStatusResult {
            watching: state.watching,
            paths: state.paths.clone(),
            languages: state.languages.clone(),
            update_count: state.update_count,
            update_time: state.last_update.map(|t| t.to_rfc3339()),
        })
    }

    fn update_run(&self, request: &Request) -> RpcResult {
        let params: UpdateRunParams = request.parse_params()?;
        let _guard = lock(&self.update_lock);

        let tracker = self.app.tracker(&params.languages).map_err(rpc_error)?;
        let snapshot = tracker.snapshot().map_err(rpc_error)?;
        let changes = snapshot.changes.clone();
        if changes.is_empty() && !params.force {
            return to_result(UpdateRunResult {
                status: STATUS_UP_TO_DATE.to_string(),
                targets: Vec::new(),
                changes,
            });
        }

        let targets = if changes.is_empty() {
            vec![ALL_TARGETS.to_string()]
        } else {
            changes.as_targets()
        };
        self.app
            .updater
            .update(&self.app.workspace, &targets)
            .map_err(rpc_error)?;
        tracker.commit(&snapshot).map_err(rpc_error)?;

        info!(targets = targets.len(), forced = params.force, "update finished");
        to_result(UpdateRunResult {
            status: STATUS_UPDATED.to_string(),
            targets,
            changes,
        })
    }

    fn status_get(&self, request: &Request) -> RpcResult {
        let params: StatusGetParams = request.parse_params()?;
        let tracker = self.app.tracker(&params.languages).map_err(rpc_error)?;
        let has_baseline = tracker.has_baseline();
        let changes = tracker.status().map_err(rpc_error)?;
        to_result(StatusGetResult {
            stale: !changes.is_empty(),
            has_baseline,
            changes,
        })
    }

    /// Counts updates, then broadcasts every event to subscribers.
    fn event_sink(&self) -> EventSink {
        let watch = Arc::downgrade(&self.watch);
        let registry = Arc::clone(&self.registry);
        Arc::new(move |event: WatchEventParams| {
            if event.event_type == EVENT_UPDATE {
                if let Some(watch) = watch.upgrade() {
                    let mut state = lock(&watch);
                    state.update_count += 1;
                    state.last_update = Some(Utc::now());
                }
            }
            match Notification::new(METHOD_WATCH_EVENT, &event) {
                Ok(note) => registry.broadcast(&note),
                Err(e) => warn!(error = %e, "failed to encode watch event"),
            }
        })
    }
}

fn already_watching(state: &WatchState) -> RpcResult {
    to_result(WatchStartResult {
        status: STATUS_ALREADY_WATCHING.to_string(),
        paths: state.paths.clone(),
        languages: state.languages.clone(),
    })
}

/// Flips the handler back to not-watching when the watcher thread ends on its own.
fn exit_hook(watch: Weak<Mutex<WatchState>>, session: u64) -> impl FnOnce() + Send + 'static {
    move || {
        let Some(watch) = watch.upgrade() else {
            return;
        };
        let watcher = {
            let mut state = lock(&watch);
            if state.session != session || !state.watching {
                return;
            }
            warn!(session, "watcher exited, watch state reset");
            state.watching = false;
            state.paths.clear();
            state.languages.clear();
            state.watcher.take()
        };
        drop(watcher);
    }
}
