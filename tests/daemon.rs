//! End-to-end tests: a real server on a temporary socket, driven by the client.

use bazelle::daemon::lifecycle::{read_pid, write_pid};
use bazelle::daemon::protocol::*;
use bazelle::daemon::{
    Client, ConnectionState, Paths, ReconnectPolicy, ReconnectingClient, Server, ShutdownSignal,
};
use bazelle::{App, BazelleError, Config};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

const VERSION: &str = "1.2.3-test";

struct TestDaemon {
    server: Arc<Server>,
    thread: Option<JoinHandle<bazelle::Result<()>>>,
    paths: Paths,
}

impl TestDaemon {
    fn start(app: App) -> Self {
        let paths = app.paths.clone();
        let server = Arc::new(Server::new(Arc::new(app), ShutdownSignal::new()));
        let runner = Arc::clone(&server);
        let thread = thread::spawn(move || runner.start());

        let deadline = Instant::now() + Duration::from_secs(5);
        while Client::connect(&paths.socket, Duration::from_millis(200)).is_err() {
            assert!(Instant::now() < deadline, "daemon did not come up");
            thread::sleep(Duration::from_millis(20));
        }
        Self {
            server,
            thread: Some(thread),
            paths,
        }
    }

    fn client(&self) -> Client {
        Client::connect(&self.paths.socket, Duration::from_secs(2))
            .unwrap()
            .with_request_timeout(Some(Duration::from_secs(10)))
    }

    fn raw(&self) -> (UnixStream, BufReader<UnixStream>) {
        let stream = UnixStream::connect(&self.paths.socket).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        (stream, reader)
    }

    fn join(&mut self) -> bazelle::Result<()> {
        match self.thread.take() {
            Some(thread) => thread.join().unwrap(),
            None => Ok(()),
        }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.server.request_shutdown();
        let _ = self.join();
    }
}

fn workspace(tmp: &TempDir) -> PathBuf {
    let ws = tmp.path().join("ws");
    fs::create_dir_all(ws.join("src")).unwrap();
    fs::write(ws.join("src/main.go"), "package main\n").unwrap();
    ws.canonicalize().unwrap()
}

fn test_app(tmp: &TempDir) -> App {
    let mut config = Config::default();
    config.daemon.handle_signals = false;
    config.daemon.shutdown_timeout_ms = 2000;
    config.daemon.debounce_ms = 50;
    App::new(workspace(tmp), config)
        .with_paths(Paths::new(tmp.path().join("d")))
        .with_version(VERSION)
}

fn send_line(stream: &mut UnixStream, line: &str) {
    stream.write_all(line.as_bytes()).unwrap();
    stream.write_all(b"\n").unwrap();
}

fn read_response(reader: &mut BufReader<UnixStream>) -> Response {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    serde_json::from_str(&line).unwrap()
}

fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut f: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    f()
}

#[test]
fn test_socket_and_pid_files() {
    let tmp = tempdir().unwrap();
    let daemon = TestDaemon::start(test_app(&tmp));

    let mode = fs::metadata(&daemon.paths.socket).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    assert_eq!(read_pid(&daemon.paths.pid), Some(std::process::id() as i32));
}

#[test]
fn test_ping() {
    let tmp = tempdir().unwrap();
    let daemon = TestDaemon::start(test_app(&tmp));

    let result = daemon.client().ping().unwrap();
    assert!(result.pong);
    assert_eq!(result.version, VERSION);
    assert!(!result.start_time.is_empty());
}

#[test]
fn test_shutdown_rpc_removes_files() {
    let tmp = tempdir().unwrap();
    let mut daemon = TestDaemon::start(test_app(&tmp));

    let result = daemon.client().shutdown().unwrap();
    assert!(!result.message.is_empty());

    daemon.join().unwrap();
    assert!(!daemon.paths.socket.exists());
    assert!(!daemon.paths.pid.exists());
}

#[test]
fn test_start_cleans_stale_files() {
    let tmp = tempdir().unwrap();
    let app = test_app(&tmp);
    app.paths.ensure_dir().unwrap();
    fs::write(&app.paths.socket, "").unwrap();
    write_pid(&app.paths.pid, 999_999_999).unwrap();

    let daemon = TestDaemon::start(app);
    assert!(daemon.client().ping().unwrap().pong);
    assert_eq!(read_pid(&daemon.paths.pid), Some(std::process::id() as i32));
}

#[test]
fn test_second_server_refused() {
    let tmp = tempdir().unwrap();
    let daemon = TestDaemon::start(test_app(&tmp));

    let second = Server::new(Arc::new(test_app(&tmp)), ShutdownSignal::new());
    let err = second.start().unwrap_err();
    assert!(matches!(err, BazelleError::AlreadyRunning(_)));

    // The first daemon keeps its files.
    assert!(daemon.paths.socket.exists());
    assert!(daemon.client().ping().is_ok());
}

#[test]
fn test_watch_start_twice() {
    let tmp = tempdir().unwrap();
    let daemon = TestDaemon::start(test_app(&tmp));
    let client = daemon.client();

    let first = client
        .watch_start(&WatchStartParams {
            paths: vec!["src".to_string()],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(first.status, STATUS_STARTED);

    let second = daemon
        .client()
        .watch_start(&WatchStartParams {
            paths: vec![".".to_string()],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(second.status, STATUS_ALREADY_WATCHING);
    assert_eq!(second.paths, vec!["src".to_string()]);

    let status = client.watch_status().unwrap();
    assert!(status.watching);
    assert_eq!(status.paths, vec!["src".to_string()]);

    assert_eq!(client.watch_stop().unwrap().status, STATUS_STOPPED);
    assert_eq!(client.watch_stop().unwrap().status, STATUS_NOT_WATCHING);
    assert!(!client.watch_status().unwrap().watching);
}

#[test]
fn test_watch_missing_path_is_invalid_params() {
    let tmp = tempdir().unwrap();
    let daemon = TestDaemon::start(test_app(&tmp));

    let err = daemon
        .client()
        .watch_start(&WatchStartParams {
            paths: vec!["does/not/exist".to_string()],
            ..Default::default()
        })
        .unwrap_err();
    match err {
        BazelleError::Rpc { code, .. } => assert_eq!(code, INVALID_PARAMS),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_parse_error_keeps_connection() {
    let tmp = tempdir().unwrap();
    let daemon = TestDaemon::start(test_app(&tmp));
    let (mut stream, mut reader) = daemon.raw();

    send_line(&mut stream, "this is not json");
    let response = read_response(&mut reader);
    assert_eq!(response.id, None);
    assert_eq!(response.error().unwrap().code, PARSE_ERROR);

    send_line(&mut stream, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
    let response = read_response(&mut reader);
    assert_eq!(response.id, Some(1));
    assert_eq!(response.result().unwrap()["pong"], true);
}

#[test]
fn test_invalid_request_and_version() {
    let tmp = tempdir().unwrap();
    let daemon = TestDaemon::start(test_app(&tmp));
    let (mut stream, mut reader) = daemon.raw();

    send_line(&mut stream, r#"{"jsonrpc":"1.0","id":4,"method":"ping"}"#);
    let response = read_response(&mut reader);
    assert_eq!(response.id, Some(4));
    assert_eq!(response.error().unwrap().code, INVALID_REQUEST);

    send_line(&mut stream, r#"{"jsonrpc":"2.0","id":5,"method":42}"#);
    let response = read_response(&mut reader);
    assert_eq!(response.error().unwrap().code, INVALID_REQUEST);

    send_line(&mut stream, r#"{"jsonrpc":"2.0","id":6,"method":"nope"}"#);
    let response = read_response(&mut reader);
    assert_eq!(response.id, Some(6));
    assert_eq!(response.error().unwrap().code, METHOD_NOT_FOUND);
}

#[test]
fn test_notification_gets_no_response() {
    let tmp = tempdir().unwrap();
    let daemon = TestDaemon::start(test_app(&tmp));
    let (mut stream, mut reader) = daemon.raw();

    send_line(&mut stream, r#"{"jsonrpc":"2.0","method":"ping"}"#);
    send_line(&mut stream, r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#);

    let response = read_response(&mut reader);
    assert_eq!(response.id, Some(7));
}

#[test]
fn test_concurrent_calls() {
    let tmp = tempdir().unwrap();
    let daemon = TestDaemon::start(test_app(&tmp));
    let client = Arc::new(daemon.client());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                for _ in 0..20 {
                    assert!(client.ping().unwrap().pong);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_watch_event_delivered() {
    let tmp = tempdir().unwrap();
    let app = test_app(&tmp);
    let ws = app.workspace.clone();
    let daemon = TestDaemon::start(app);
    let client = daemon.client();
    let events = client.subscribe_events().unwrap().unwrap();

    client
        .watch_start(&WatchStartParams {
            paths: vec!["src".to_string()],
            languages: vec!["go".to_string()],
            debounce_ms: 50,
        })
        .unwrap();
    fs::write(ws.join("src/extra.go"), "package main\n").unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let event = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let note = events.recv_timeout(remaining).expect("no watch event");
        assert_eq!(note.method, METHOD_WATCH_EVENT);
        let event: WatchEventParams = note.parse_params().unwrap();
        if event.event_type == EVENT_UPDATE {
            break event;
        }
    };
    assert_eq!(event.added, vec!["src/extra.go".to_string()]);
    assert_eq!(event.targets, vec!["//src:all".to_string()]);

    assert!(wait_for(Duration::from_secs(2), || {
        client.watch_status().unwrap().update_count >= 1
    }));
}

#[test]
fn test_status_and_update_flow() {
    let tmp = tempdir().unwrap();
    let app = test_app(&tmp);
    let ws = app.workspace.clone();
    let daemon = TestDaemon::start(app);
    let client = daemon.client();

    let status = client.status_get(&StatusGetParams::default()).unwrap();
    assert!(!status.has_baseline);
    assert!(status.stale);

    let result = client.update_run(&UpdateRunParams::default()).unwrap();
    assert_eq!(result.status, STATUS_UPDATED);
    assert_eq!(result.targets, vec!["//src:all".to_string()]);

    let status = client.status_get(&StatusGetParams::default()).unwrap();
    assert!(status.has_baseline);
    assert!(!status.stale);

    let result = client.update_run(&UpdateRunParams::default()).unwrap();
    assert_eq!(result.status, STATUS_UP_TO_DATE);

    fs::create_dir_all(ws.join("lib")).unwrap();
    fs::write(ws.join("lib/util.go"), "package lib\n").unwrap();
    let status = client.status_get(&StatusGetParams::default()).unwrap();
    assert_eq!(status.changes.added, vec!["lib/util.go".to_string()]);
}

#[test]
fn test_shutdown_notifies_subscribers() {
    let tmp = tempdir().unwrap();
    let mut daemon = TestDaemon::start(test_app(&tmp));
    let client = daemon.client();
    let events = client.subscribe_events().unwrap().unwrap();
    client.watch_start(&WatchStartParams::default()).unwrap();

    daemon.server.request_shutdown();
    daemon.join().unwrap();

    let note = events.recv_timeout(Duration::from_secs(5)).unwrap();
    let event: WatchEventParams = note.parse_params().unwrap();
    assert_eq!(event.event_type, EVENT_SHUTDOWN);

    // The channel closes once the client's reader has seen EOF.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match events.recv_timeout(Duration::from_millis(100)) {
            Err(RecvTimeoutError::Disconnected) => break,
            _ => assert!(Instant::now() < deadline, "event channel never closed"),
        }
    }
    assert!(!client.is_connected());
    assert!(matches!(client.ping(), Err(BazelleError::NotConnected)));
}

#[test]
fn test_client_not_running() {
    let tmp = tempdir().unwrap();
    let err = Client::connect(&tmp.path().join("daemon.sock"), Duration::from_secs(1))
        .err()
        .unwrap();
    assert!(matches!(err, BazelleError::NotRunning(_)));
}

fn restart(tmp: &TempDir, ws: &Path) -> TestDaemon {
    let mut config = Config::default();
    config.daemon.handle_signals = false;
    config.daemon.shutdown_timeout_ms = 2000;
    let app = App::new(ws.to_path_buf(), config)
        .with_paths(Paths::new(tmp.path().join("d")))
        .with_version(VERSION);
    TestDaemon::start(app)
}

#[test]
fn test_reconnecting_client_replays_watch() {
    let tmp = tempdir().unwrap();
    let app = test_app(&tmp);
    let ws = app.workspace.clone();
    let mut first = TestDaemon::start(app);

    let policy = ReconnectPolicy {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        multiplier: 2.0,
        max_attempts: 50,
    };
    let client = ReconnectingClient::new(&first.paths.socket, policy);
    client.connect().unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    client
        .watch_start(&WatchStartParams {
            paths: vec!["src".to_string()],
            ..Default::default()
        })
        .unwrap();

    first.server.request_shutdown();
    first.join().unwrap();
    assert!(client.wait_for_state(ConnectionState::Reconnecting, Duration::from_secs(5)));

    let _second = restart(&tmp, &ws);
    assert!(client.wait_for_state(ConnectionState::Connected, Duration::from_secs(10)));
    assert!(wait_for(Duration::from_secs(5), || {
        client
            .watch_status()
            .map(|s| s.watching && s.paths == vec!["src".to_string()])
            .unwrap_or(false)
    }));
    client.close();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
