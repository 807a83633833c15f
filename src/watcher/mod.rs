//! File watcher — turns filesystem events into incremental updates.
//!
//! Raw `notify` events are filtered against the scan options, reduced to
//! their parent directories and fed into a [`Debouncer`]. Each debounced
//! batch asks the tracker what changed, hands the affected targets to the
//! updater, commits a new baseline and reports a `watch/event` to the sink.

pub mod debounce;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::app::App;
use crate::daemon::protocol::WatchEventParams;
use crate::error::{BazelleError, Result};
use crate::incremental::index::parent_dir;
use crate::incremental::scanner::relative_path;
use crate::incremental::{ScanOptions, Tracker};
use crate::update::Updater;

pub use debounce::{Debouncer, DEFAULT_MAX_PENDING_DIRS};

/// Receives every event a watcher produces.
pub type EventSink = Arc<dyn Fn(WatchEventParams) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    /// Workspace-relative or absolute directories.
    pub paths: Vec<String>,
    /// Empty means the configured default.
    pub languages: Vec<String>,
    pub debounce: Duration,
}

enum WatchMsg {
    Fs(notify::Result<notify::Event>),
    Stop,
}

/// A running watch session. Stopped explicitly or on drop.
pub struct Watcher {
    tx: Sender<WatchMsg>,
    debouncer: Debouncer,
    thread: Option<JoinHandle<()>>,
    roots: Vec<PathBuf>,
}

impl Watcher {
    /// Validate the paths, make sure a baseline exists and start watching.
    ///
    /// `on_exit` runs on the watcher thread once its loop has ended, for
    /// whatever reason.
    pub fn start<F>(app: Arc<App>, options: WatchOptions, sink: EventSink, on_exit: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let tracker = app.tracker(&options.languages)?;
        let roots = resolve_roots(&app.workspace, &options.paths)?;

        if !tracker.has_baseline() {
            info!(workspace = %app.workspace.display(), "no baseline, running full scan");
            tracker.refresh()?;
        }

        let (tx, rx) = mpsc::channel();
        let fs_tx = tx.clone();
        let mut backend = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = fs_tx.send(WatchMsg::Fs(res));
        })?;
        for root in &roots {
            backend.watch(root, RecursiveMode::Recursive)?;
        }

        let flush = FlushPipeline {
            tracker: tracker.clone(),
            updater: Arc::clone(&app.updater),
            workspace: app.workspace.clone(),
            sink: Arc::clone(&sink),
        };
        let debouncer = Debouncer::new(
            options.debounce,
            app.config.watch.max_pending_dirs,
            move |dirs| flush.run(dirs),
        );

        let run = RunLoop {
            _backend: backend,
            rx,
            debouncer: debouncer.clone(),
            options: tracker.scanner().options().clone(),
            workspace: app.workspace.clone(),
            sink,
        };
        let thread = thread::Builder::new()
            .name("bazelle-watcher".to_string())
            .spawn(move || {
                run.run();
                on_exit();
            })?;

        info!(
            paths = ?options.paths,
            debounce_ms = options.debounce.as_millis() as u64,
            "file watcher started"
        );

        Ok(Self {
            tx,
            debouncer,
            thread: Some(thread),
            roots,
        })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Feed a backend error into the loop as if `notify` had reported it.
    #[cfg(test)]
    pub(crate) fn inject_error(&self, message: &str) {
        let _ = self.tx.send(WatchMsg::Fs(Err(notify::Error::generic(message))));
    }

    /// End the session: final flush, then join the watcher thread (unless
    /// called from it). Safe to call more than once.
    pub fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        let _ = self.tx.send(WatchMsg::Stop);
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("watcher thread panicked");
        }
        self.debouncer.stop();
        info!("file watcher stopped");
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Absolute roots for `paths`; every one of them must exist.
fn resolve_roots(workspace: &Path, paths: &[String]) -> Result<Vec<PathBuf>> {
    paths
        .iter()
        .map(|p| {
            let path = Path::new(p);
            let abs = if path.is_absolute() {
                path.to_path_buf()
            } else {
                workspace.join(path)
            };
            if abs.is_dir() {
                Ok(abs)
            } else {
                Err(BazelleError::PathNotFound(p.clone()))
            }
        })
        .collect()
}

struct RunLoop {
    /// Kept alive for as long as the loop runs.
    _backend: RecommendedWatcher,
    rx: Receiver<WatchMsg>,
    debouncer: Debouncer,
    options: ScanOptions,
    workspace: PathBuf,
    sink: EventSink,
}

impl RunLoop {
    fn run(self) {
        while let Ok(msg) = self.rx.recv() {
            match msg {
                WatchMsg::Stop => break,
                WatchMsg::Fs(Ok(event)) => self.handle_event(event),
                WatchMsg::Fs(Err(e)) => {
                    error!(error = %e, "file watcher error");
                    (self.sink)(WatchEventParams::error(e.to_string()));
                    break;
                }
            }
        }
        self.debouncer.stop();
        debug!("watcher loop exited");
    }

    fn handle_event(&self, event: notify::Event) {
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }
        for path in &event.paths {
            let Ok(rel) = path.strip_prefix(&self.workspace) else {
                continue;
            };
            if !self.options.tracks(rel) {
                continue;
            }
            let rel = relative_path(&self.workspace, path);
            self.debouncer.add(parent_dir(&rel));
        }
    }
}

/// What a debounced batch does.
struct FlushPipeline {
    tracker: Tracker,
    updater: Arc<dyn Updater>,
    workspace: PathBuf,
    sink: EventSink,
}

impl FlushPipeline {
    fn run(&self, dirs: Vec<String>) {
        debug!(dirs = ?dirs, "processing debounced directories");

        let snapshot = match self.tracker.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "change detection failed");
                (self.sink)(WatchEventParams::error(e.to_string()));
                return;
            }
        };
        let changes = &snapshot.changes;
        if changes.is_empty() {
            debug!("no tracked changes");
            return;
        }

        let targets = changes.as_targets();
        if let Err(e) = self.updater.update(&self.workspace, &targets) {
            warn!(error = %e, ?targets, "update failed");
            (self.sink)(WatchEventParams::error(e.to_string()));
            return;
        }
        if let Err(e) = self.tracker.commit(&snapshot) {
            warn!(error = %e, "baseline commit failed");
        }

        info!(
            added = changes.added.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            "workspace updated"
        );
        (self.sink)(WatchEventParams::update(changes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;
    use tempfile::tempdir;

    fn app(ws: &Path) -> Arc<App> {
        let mut config = Config::default();
        config.watch.languages = vec!["go".to_string()];
        Arc::new(App::new(ws.canonicalize().unwrap(), config))
    }

    fn options(paths: &[&str]) -> WatchOptions {
        WatchOptions {
            paths: paths.iter().map(|s| s.to_string()).collect(),
            languages: Vec::new(),
            debounce: Duration::from_millis(100),
        }
    }

    fn wait_for(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(25));
        }
        cond()
    }

    #[test]
    fn test_missing_path_is_rejected() {
        let ws = tempdir().unwrap();
        let sink: EventSink = Arc::new(|_| {});
        let err = Watcher::start(app(ws.path()), options(&["nope"]), sink, || {})
            .err()
            .unwrap();
        assert!(matches!(err, BazelleError::PathNotFound(p) if p == "nope"));
    }

    #[test]
    fn test_start_establishes_baseline() {
        let ws = tempdir().unwrap();
        fs::write(ws.path().join("main.go"), "package main\n").unwrap();
        let app = app(ws.path());
        let sink: EventSink = Arc::new(|_| {});

        let mut watcher = Watcher::start(Arc::clone(&app), options(&["."]), sink, || {}).unwrap();
        assert!(app.tracker(&[]).unwrap().has_baseline());
        watcher.stop();
    }

    #[test]
    fn test_change_produces_update_event() {
        let ws = tempdir().unwrap();
        fs::create_dir_all(ws.path().join("pkg")).unwrap();
        fs::write(ws.path().join("pkg/a.go"), "package pkg\n").unwrap();
        let app = app(ws.path());

        let events: Arc<Mutex<Vec<WatchEventParams>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let sink: EventSink = Arc::new(move |e| seen.lock().unwrap().push(e));

        let mut watcher = Watcher::start(Arc::clone(&app), options(&["."]), sink, || {}).unwrap();
        thread::sleep(Duration::from_millis(200));
        fs::write(ws.path().join("pkg/b.go"), "package pkg\n\nfunc B() {}\n").unwrap();
        fs::write(ws.path().join("notes.txt"), "ignored\n").unwrap();

        assert!(wait_for(Duration::from_secs(5), || !events.lock().unwrap().is_empty()));
        let event = events.lock().unwrap()[0].clone();
        assert_eq!(event.event_type, "update");
        assert_eq!(event.added, vec!["pkg/b.go"]);
        assert_eq!(event.targets, vec!["//pkg:all"]);

        watcher.stop();
        // The update committed a new baseline.
        assert!(app.tracker(&[]).unwrap().status().unwrap().is_empty());
    }

    #[test]
    fn test_backend_error_ends_loop() {
        let ws = tempdir().unwrap();
        let exited = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&exited);
        let events: Arc<Mutex<Vec<WatchEventParams>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let sink: EventSink = Arc::new(move |e| seen.lock().unwrap().push(e));

        let mut watcher = Watcher::start(app(ws.path()), options(&["."]), sink, move || {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        watcher.inject_error("inotify queue overflow");

        assert!(wait_for(Duration::from_secs(5), || exited.load(Ordering::SeqCst)));
        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "error");
        watcher.stop();
    }

    #[test]
    fn test_stop_runs_exit_hook_once() {
        let ws = tempdir().unwrap();
        let exited = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&exited);
        let sink: EventSink = Arc::new(|_| {});

        let mut watcher = Watcher::start(app(ws.path()), options(&["."]), sink, move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        })
        .unwrap();
        watcher.stop();
        watcher.stop();
        assert!(exited.load(Ordering::SeqCst));
    }
}
