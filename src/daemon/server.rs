//! Daemon server — Unix socket listener, connection loops and shutdown.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::handler::Handler;
use super::lifecycle;
use super::protocol::{
    Notification, Request, Response, RpcError, WatchEventParams, METHOD_WATCH_EVENT,
};
use super::tasks::{forward_os_signals, ShutdownSignal, TaskGroup};
use crate::app::App;
use crate::error::{BazelleError, Result};

/// Longest accepted request line.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// A client that stops reading cannot block a writer for longer than this.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Connections ────────────────────────────────────────────────

/// Write half of one accepted connection.
#[derive(Debug)]
pub struct ClientConn {
    id: u64,
    writer: Mutex<UnixStream>,
    /// Used to shut the socket down without waiting for a writer.
    control: UnixStream,
    subscribed: AtomicBool,
    closed: AtomicBool,
}

impl ClientConn {
    pub fn new(id: u64, stream: &UnixStream) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        writer.set_write_timeout(Some(WRITE_TIMEOUT))?;
        Ok(Self {
            id,
            writer: Mutex::new(writer),
            control: stream.try_clone()?,
            subscribed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Write one message as a single line.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        if self.is_closed() {
            return Err(BazelleError::NotConnected);
        }
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut writer = lock(&self.writer);
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }

    /// Opt in to `watch/event` broadcasts.
    pub fn subscribe(&self) {
        self.subscribed.store(true, Ordering::SeqCst);
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shut both directions down; the read loop sees EOF. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.control.shutdown(Shutdown::Both);
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    clients: HashMap<u64, Arc<ClientConn>>,
    closed: bool,
}

/// Every live connection, keyed by connection id.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    state: RwLock<RegistryState>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns false (and closes `conn`) once the registry has been closed.
    pub fn register(&self, conn: Arc<ClientConn>) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            drop(state);
            conn.close();
            return false;
        }
        state.clients.insert(conn.id(), conn);
        true
    }

    pub fn remove(&self, id: u64) -> Option<Arc<ClientConn>> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.clients.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clients
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send to every subscribed client. Clients that fail are closed.
    pub fn broadcast(&self, notification: &Notification) {
        let targets: Vec<Arc<ClientConn>> = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            state
                .clients
                .values()
                .filter(|c| c.is_subscribed())
                .cloned()
                .collect()
        };
        for conn in targets {
            if let Err(e) = conn.send(notification) {
                debug!(client = conn.id(), error = %e, "broadcast failed, dropping client");
                conn.close();
            }
        }
    }

    /// Close every connection and refuse new ones.
    pub fn close_all(&self) {
        let clients: Vec<Arc<ClientConn>> = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
            state.clients.drain().map(|(_, c)| c).collect()
        };
        for conn in clients {
            conn.close();
        }
    }
}

// ─── Server ─────────────────────────────────────────────────────

type CleanupOutcome = Option<(PathBuf, String)>;

pub struct Server {
    app: Arc<App>,
    signal: ShutdownSignal,
    registry: Arc<ClientRegistry>,
    handler: Arc<Handler>,
    tasks: TaskGroup,
    listening: AtomicBool,
    /// `Some` once shutdown has run; holds the first cleanup error.
    shutdown_outcome: Mutex<Option<CleanupOutcome>>,
}

impl Server {
    /// `signal` is the cancellation token; triggering it from anywhere stops `start`.
    pub fn new(app: Arc<App>, signal: ShutdownSignal) -> Self {
        let registry = Arc::new(ClientRegistry::new());
        let handler = Arc::new(Handler::new(
            Arc::clone(&app),
            Arc::clone(&registry),
            signal.clone(),
        ));
        Self {
            app,
            signal,
            registry,
            handler,
            tasks: TaskGroup::new(),
            listening: AtomicBool::new(false),
            shutdown_outcome: Mutex::new(None),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn handler(&self) -> &Arc<Handler> {
        &self.handler
    }

    /// Ask `start` to return. Safe to call any number of times.
    pub fn request_shutdown(&self) {
        if self.signal.trigger() {
            info!("shutdown requested");
        }
    }

    /// Bind, serve, and block until shutdown is triggered. Cleans up on return.
    pub fn start(&self) -> Result<()> {
        let paths = &self.app.paths;

        match lifecycle::cleanup_stale(paths) {
            Ok(true) => info!(dir = %paths.dir.display(), "cleaned up stale daemon files"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "stale file cleanup failed"),
        }
        let status = lifecycle::get_status(Some(paths));
        if status.running {
            return Err(BazelleError::AlreadyRunning(status.pid));
        }

        paths.ensure_dir()?;
        let listener = UnixListener::bind(&paths.socket)?;
        self.listening.store(true, Ordering::SeqCst);

        let prepared = fs::set_permissions(&paths.socket, fs::Permissions::from_mode(0o600))
            .map_err(BazelleError::from)
            .and_then(|()| lifecycle::write_pid(&paths.pid, std::process::id()));
        if let Err(e) = prepared {
            drop(listener);
            let _ = self.shutdown();
            return Err(e);
        }

        let os_signals = if self.app.config.daemon.handle_signals {
            Some(forward_os_signals(self.signal.clone())?)
        } else {
            None
        };

        self.spawn_accept_loop(listener)?;
        info!(
            socket = %paths.socket.display(),
            pid = std::process::id(),
            version = %self.app.version,
            "daemon listening"
        );

        self.signal.wait();

        if let Some(handle) = os_signals {
            handle.close();
        }
        self.shutdown()
    }

    fn spawn_accept_loop(&self, listener: UnixListener) -> Result<()> {
        let signal = self.signal.clone();
        let registry = Arc::clone(&self.registry);
        let handler = Arc::clone(&self.handler);
        let tasks = self.tasks.clone();

        self.tasks.spawn("bazelle-accept", move || {
            for stream in listener.incoming() {
                if signal.is_triggered() {
                    break;
                }
                match stream {
                    Ok(stream) => accept(stream, &registry, &handler, &tasks),
                    Err(e) => {
                        error!(error = %e, "accept error");
                        thread::sleep(Duration::from_millis(50));
                    }
                }
            }
            debug!("accept loop exited");
        })?;
        Ok(())
    }

    /// Stop everything and remove our files. Later calls return the first
    /// call's result.
    pub fn shutdown(&self) -> Result<()> {
        let mut outcome = lock(&self.shutdown_outcome);
        if let Some(cached) = outcome.as_ref() {
            return cleanup_result(cached.clone());
        }

        info!("daemon shutting down");
        self.signal.trigger();

        let listening = self.listening.load(Ordering::SeqCst);
        if listening {
            // Unblock the accept loop.
            let _ = UnixStream::connect(&self.app.paths.socket);
        }

        match Notification::new(METHOD_WATCH_EVENT, &WatchEventParams::shutdown()) {
            Ok(note) => self.registry.broadcast(&note),
            Err(e) => warn!(error = %e, "failed to encode shutdown notification"),
        }
        self.handler.stop();
        self.registry.close_all();

        let timeout = self.app.config.daemon.shutdown_timeout();
        if !self.tasks.wait_timeout(timeout) {
            warn!(
                active = self.tasks.active(),
                timeout_ms = timeout.as_millis() as u64,
                "timed out waiting for connections to finish"
            );
        }

        let mut first_error: CleanupOutcome = None;
        if listening {
            let paths = &self.app.paths;
            if let Err(e) = remove_file(&paths.socket) {
                first_error.get_or_insert(e);
            }
            if lifecycle::read_pid(&paths.pid) == Some(std::process::id() as i32) {
                if let Err(e) = remove_file(&paths.pid) {
                    first_error.get_or_insert(e);
                }
            }
        }

        info!("daemon stopped");
        *outcome = Some(first_error.clone());
        cleanup_result(first_error)
    }
}

fn cleanup_result(outcome: CleanupOutcome) -> Result<()> {
    match outcome {
        None => Ok(()),
        Some((path, message)) => Err(BazelleError::Cleanup { path, message }),
    }
}

fn remove_file(path: &Path) -> std::result::Result<(), (PathBuf, String)> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to remove daemon file");
            Err((path.to_path_buf(), e.to_string()))
        }
    }
}

// ─── Per-connection loop ────────────────────────────────────────

fn accept(stream: UnixStream, registry: &Arc<ClientRegistry>, handler: &Arc<Handler>, tasks: &TaskGroup) {
    let id = registry.next_id();
    let conn = match ClientConn::new(id, &stream) {
        Ok(conn) => Arc::new(conn),
        Err(e) => {
            warn!(error = %e, "failed to set up connection");
            return;
        }
    };
    if !registry.register(Arc::clone(&conn)) {
        return;
    }
    debug!(client = id, "client connected");

    let registry = Arc::clone(registry);
    let handler = Arc::clone(handler);
    let spawned = tasks.spawn("bazelle-conn", move || {
        let _cleanup = ConnCleanup {
            registry,
            conn: Arc::clone(&conn),
        };
        serve_connection(stream, &conn, &handler);
    });
    if let Err(e) = spawned {
        error!(client = id, error = %e, "failed to spawn connection thread");
    }
}

/// Deregisters and closes a connection however its loop ends.
struct ConnCleanup {
    registry: Arc<ClientRegistry>,
    conn: Arc<ClientConn>,
}

impl Drop for ConnCleanup {
    fn drop(&mut self) {
        self.registry.remove(self.conn.id());
        self.conn.close();
        debug!(client = self.conn.id(), "client disconnected");
    }
}

enum Line {
    Data,
    TooLong,
    Eof,
}

/// Read one `\n`-terminated line into `buf`, up to `limit` bytes. Longer
/// lines are consumed and dropped.
fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<Line> {
    buf.clear();
    let n = reader.by_ref().take(limit as u64 + 1).read_until(b'\n', buf)?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if buf.len() > limit && buf.last() != Some(&b'\n') {
        buf.clear();
        discard_until_newline(reader)?;
        return Ok(Line::TooLong);
    }
    Ok(Line::Data)
}

fn discard_until_newline<R: BufRead>(reader: &mut R) -> io::Result<()> {
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(());
        }
        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            reader.consume(pos + 1);
            return Ok(());
        }
        let len = available.len();
        reader.consume(len);
    }
}

fn serve_connection(stream: UnixStream, conn: &Arc<ClientConn>, handler: &Handler) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        let response = match read_line(&mut reader, &mut buf, MAX_LINE_BYTES) {
            Ok(Line::Eof) => break,
            Ok(Line::TooLong) => {
                warn!(client = conn.id(), limit = MAX_LINE_BYTES, "request line too long");
                Some(Response::failure(
                    None,
                    RpcError::parse_error(format!("message exceeds {MAX_LINE_BYTES} bytes")),
                ))
            }
            Ok(Line::Data) => {
                if buf.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                process_line(&buf, conn, handler)
            }
            Err(e) => {
                if !conn.is_closed() {
                    debug!(client = conn.id(), error = %e, "read error");
                }
                break;
            }
        };

        if let Some(response) = response {
            if let Err(e) = conn.send(&response) {
                debug!(client = conn.id(), error = %e, "write failed");
                break;
            }
        }
    }
}

/// Decode and dispatch one line. `None` means nothing is sent back.
fn process_line(line: &[u8], conn: &Arc<ClientConn>, handler: &Handler) -> Option<Response> {
    let value: Value = match serde_json::from_slice(line) {
        Ok(v) => v,
        Err(e) => {
            debug!(client = conn.id(), error = %e, "parse error");
            return Some(Response::failure(None, RpcError::parse_error(e.to_string())));
        }
    };
    let id_hint = value.get("id").and_then(Value::as_i64);

    let request: Request = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            return Some(Response::failure(id_hint, RpcError::invalid_request(e.to_string())));
        }
    };
    if !request.has_valid_version() {
        return Some(Response::failure(
            request.id,
            RpcError::invalid_request(format!(
                "unsupported jsonrpc version {:?}",
                request.jsonrpc
            )),
        ));
    }
    if request.is_notification() {
        debug!(client = conn.id(), method = %request.method, "notification received, no response");
        return None;
    }

    debug!(client = conn.id(), id = ?request.id, method = %request.method, "request");
    let response = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&request, conn)))
        .unwrap_or_else(|_| {
            error!(method = %request.method, "handler panicked");
            Response::failure(
                request.id,
                RpcError::internal_error(format!("internal error handling {}", request.method)),
            )
        });
    Some(response)
}
