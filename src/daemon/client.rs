//! Daemon client.
//!
//! One reader thread per connection routes every incoming message:
//! responses go to the caller waiting on that id, notifications go to the
//! event channel. Calls can therefore be issued from several threads at once
//! over the same connection.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use super::protocol::*;
use crate::error::{BazelleError, Result};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Notifications buffered for a slow subscriber before new ones are dropped.
pub const EVENT_BUFFER: usize = 64;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Pending {
    waiters: HashMap<i64, Sender<Response>>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<Pending>,
    events: Mutex<Option<SyncSender<Notification>>>,
    connected: AtomicBool,
}

pub struct Client {
    socket: PathBuf,
    writer: Mutex<UnixStream>,
    control: UnixStream,
    ids: IdGenerator,
    shared: Arc<Shared>,
    /// Read half until the reader thread takes it.
    reader: Mutex<Option<UnixStream>>,
    subscribed: AtomicBool,
    request_timeout: Option<Duration>,
}

impl Client {
    /// Connect to the daemon socket. Absent or refusing sockets map to
    /// [`BazelleError::NotRunning`].
    pub fn connect(socket: &Path, timeout: Duration) -> Result<Self> {
        let stream = connect_with_timeout(socket, timeout)?;
        Self::from_stream(socket, stream)
    }

    fn from_stream(socket: &Path, stream: UnixStream) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        shared.connected.store(true, Ordering::SeqCst);
        Ok(Self {
            socket: socket.to_path_buf(),
            writer: Mutex::new(stream.try_clone()?),
            control: stream.try_clone()?,
            ids: IdGenerator::new(),
            shared,
            reader: Mutex::new(Some(stream)),
            subscribed: AtomicBool::new(false),
            request_timeout: None,
        })
    }

    /// Fail calls that get no response within `timeout`. `None` waits forever.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Start receiving `watch/event` notifications. Only the first call
    /// returns a receiver; later calls return `None`.
    pub fn subscribe_events(&self) -> Result<Option<Receiver<Notification>>> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        let (tx, rx) = mpsc::sync_channel(EVENT_BUFFER);
        *lock(&self.shared.events) = Some(tx);
        self.ensure_reader()?;
        Ok(Some(rx))
    }

    /// Send a request and wait for the response with the same id.
    pub fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.ensure_reader()?;
        let id = self.ids.next();
        let (tx, rx) = mpsc::channel();
        {
            let mut pending = lock(&self.shared.pending);
            if pending.closed {
                return Err(BazelleError::NotConnected);
            }
            pending.waiters.insert(id, tx);
        }

        if let Err(e) = self.write(&Request::new(id, method, params)) {
            lock(&self.shared.pending).waiters.remove(&id);
            return Err(e);
        }

        let response = match self.request_timeout {
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(r) => r,
                Err(RecvTimeoutError::Timeout) => {
                    lock(&self.shared.pending).waiters.remove(&id);
                    return Err(BazelleError::Timeout {
                        id,
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => return Err(BazelleError::NotConnected),
            },
            None => rx.recv().map_err(|_| BazelleError::NotConnected)?,
        };
        response.into_result()
    }

    /// Call and decode the result into `R`.
    pub fn call_typed<P, R>(&self, method: &str, params: Option<&P>) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = params.map(serde_json::to_value).transpose()?;
        let value = self.call(method, params)?;
        serde_json::from_value(value).map_err(|e| BazelleError::InvalidResponse(e.to_string()))
    }

    /// Fire-and-forget; the daemon sends nothing back.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.write(&Notification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        })
    }

    fn write<T: Serialize>(&self, message: &T) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut writer = lock(&self.writer);
        writer
            .write_all(&line)
            .and_then(|()| writer.flush())
            .map_err(|e| match e.kind() {
                io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::NotConnected => BazelleError::NotConnected,
                _ => BazelleError::Io(e),
            })
    }

    /// Start the reader thread once.
    fn ensure_reader(&self) -> Result<()> {
        let mut slot = lock(&self.reader);
        if let Some(stream) = slot.take() {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("bazelle-client-reader".to_string())
                .spawn(move || read_loop(stream, shared))?;
        }
        Ok(())
    }

    /// Close the connection. Waiting calls fail with `NotConnected`.
    pub fn close(&self) {
        let _ = self.control.shutdown(Shutdown::Both);
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    // ─── Typed methods ──────────────────────────────────────────

    pub fn ping(&self) -> Result<PingResult> {
        self.call_typed::<(), _>(METHOD_PING, None)
    }

    pub fn shutdown(&self) -> Result<ShutdownResult> {
        self.call_typed::<(), _>(METHOD_SHUTDOWN, None)
    }

    pub fn watch_start(&self, params: &WatchStartParams) -> Result<WatchStartResult> {
        self.call_typed(METHOD_WATCH_START, Some(params))
    }

    pub fn watch_stop(&self) -> Result<WatchStopResult> {
        self.call_typed::<(), _>(METHOD_WATCH_STOP, None)
    }

    pub fn watch_status(&self) -> Result<WatchStatusResult> {
        self.call_typed::<(), _>(METHOD_WATCH_STATUS, None)
    }

    pub fn update_run(&self, params: &UpdateRunParams) -> Result<UpdateRunResult> {
        self.call_typed(METHOD_UPDATE_RUN, Some(params))
    }

    pub fn status_get(&self, params: &StatusGetParams) -> Result<StatusGetResult> {
        self.call_typed(METHOD_STATUS_GET, Some(params))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

fn connect_with_timeout(socket: &Path, timeout: Duration) -> Result<UnixStream> {
    let (tx, rx) = mpsc::channel();
    let path = socket.to_path_buf();
    thread::Builder::new()
        .name("bazelle-connect".to_string())
        .spawn(move || {
            let _ = tx.send(UnixStream::connect(&path));
        })?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                Err(BazelleError::NotRunning(socket.to_path_buf()))
            }
            _ => Err(BazelleError::Io(e)),
        },
        Err(_) => Err(BazelleError::ConnectTimeout {
            path: socket.to_path_buf(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

fn read_loop(stream: UnixStream, shared: Arc<Shared>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "client read error");
                break;
            }
        }
        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match Incoming::parse(&buf) {
            Ok(Incoming::Response(response)) => dispatch_response(&shared, response),
            Ok(Incoming::Notification(note)) => {
                if let Some(tx) = lock(&shared.events).as_ref() {
                    if let Err(TrySendError::Full(_)) = tx.try_send(note) {
                        debug!("event buffer full, dropping notification");
                    }
                }
            }
            Err(e) => warn!(error = %e, "undecodable message from daemon"),
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    {
        let mut pending = lock(&shared.pending);
        pending.closed = true;
        // Dropping the senders wakes every waiting caller.
        pending.waiters.clear();
    }
    *lock(&shared.events) = None;
    debug!("client reader exited");
}

fn dispatch_response(shared: &Shared, response: Response) {
    let Some(id) = response.id else {
        warn!(error = ?response.error(), "daemon error without a request id");
        return;
    };
    let waiter = lock(&shared.pending).waiters.remove(&id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(response);
        }
        None => debug!(id, "response for an unknown or abandoned request"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::net::UnixListener;
    use tempfile::tempdir;

    #[test]
    fn test_connect_missing_socket_is_not_running() {
        let tmp = tempdir().unwrap();
        let socket = tmp.path().join("daemon.sock");
        let err = Client::connect(&socket, DEFAULT_CONNECT_TIMEOUT).err().unwrap();
        assert!(err.is_disconnect());
        assert!(matches!(err, BazelleError::NotRunning(p) if p == socket));
    }

    /// Answers requests in reverse order of arrival, two at a time.
    fn reversing_server(listener: UnixListener) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut batch = Vec::new();
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                let req: Request = serde_json::from_str(&line).unwrap();
                line.clear();
                batch.push(req);
                if batch.len() == 2 {
                    for req in batch.drain(..).rev() {
                        let resp = Response::success(req.id, json!({"echo": req.params}));
                        writeln!(writer, "{}", serde_json::to_string(&resp).unwrap()).unwrap();
                    }
                }
            }
        })
    }

    #[test]
    fn test_concurrent_calls_are_demultiplexed() {
        let tmp = tempdir().unwrap();
        let socket = tmp.path().join("s.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = reversing_server(listener);

        let client = Arc::new(Client::connect(&socket, DEFAULT_CONNECT_TIMEOUT).unwrap());
        let handles: Vec<_> = (0..2)
            .map(|i| {
                let client = Arc::clone(&client);
                thread::spawn(move || client.call("echo", Some(json!(i))).unwrap())
            })
            .collect();
        let results: Vec<Value> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], json!({"echo": 0}));
        assert_eq!(results[1], json!({"echo": 1}));

        client.close();
        server.join().unwrap();
    }

    #[test]
    fn test_request_timeout() {
        let tmp = tempdir().unwrap();
        let socket = tmp.path().join("s.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let silent = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut sink = Vec::new();
            let _ = BufReader::new(stream).read_until(b'\0', &mut sink);
        });

        let client = Client::connect(&socket, DEFAULT_CONNECT_TIMEOUT)
            .unwrap()
            .with_request_timeout(Some(Duration::from_millis(100)));
        let err = client.call("ping", None).unwrap_err();
        assert!(matches!(err, BazelleError::Timeout { id: 1, timeout_ms: 100 }));

        client.close();
        silent.join().unwrap();
    }

    #[test]
    fn test_disconnect_fails_pending_calls() {
        let tmp = tempdir().unwrap();
        let socket = tmp.path().join("s.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let closer = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut line = String::new();
            BufReader::new(&stream).read_line(&mut line).unwrap();
            drop(stream);
        });

        let client = Client::connect(&socket, DEFAULT_CONNECT_TIMEOUT).unwrap();
        let err = client.call("ping", None).unwrap_err();
        assert!(matches!(err, BazelleError::NotConnected));
        closer.join().unwrap();
        assert!(!client.is_connected());
        assert!(matches!(client.call("ping", None), Err(BazelleError::NotConnected)));
    }

    #[test]
    fn test_subscribe_is_idempotent_and_receives_notifications() {
        let tmp = tempdir().unwrap();
        let socket = tmp.path().join("s.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let client = Client::connect(&socket, DEFAULT_CONNECT_TIMEOUT).unwrap();
        let (mut server_side, _) = listener.accept().unwrap();

        let events = client.subscribe_events().unwrap().unwrap();
        assert!(client.subscribe_events().unwrap().is_none());

        let note = Notification::new(METHOD_WATCH_EVENT, &WatchEventParams::shutdown()).unwrap();
        writeln!(server_side, "{}", serde_json::to_string(&note).unwrap()).unwrap();

        let got = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got.method, METHOD_WATCH_EVENT);

        drop(server_side);
        // Reader exit closes the channel.
        assert!(events.recv_timeout(Duration::from_secs(5)).is_err());
    }
}
