//! Process lifecycle — PID file, liveness probe, stale cleanup and signals.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::paths::Paths;
use crate::error::{BazelleError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: i32,
    /// A PID file names a process that no longer exists.
    pub stale: bool,
}

/// Inspect the PID file. No paths, no file or garbage all mean "not running".
pub fn get_status(paths: Option<&Paths>) -> DaemonStatus {
    let Some(paths) = paths else {
        return DaemonStatus::default();
    };
    let Some(pid) = read_pid(&paths.pid) else {
        return DaemonStatus::default();
    };
    let running = is_process_running(pid);
    DaemonStatus {
        running,
        pid,
        stale: !running,
    }
}

/// Signal-0 probe. `EPERM` still means the process exists.
pub fn is_process_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill with signal 0 performs only the existence/permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

pub fn read_pid(path: &Path) -> Option<i32> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse().ok()
}

/// Write `pid` with mode 0600.
pub fn write_pid(path: &Path, pid: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // The mode above only applies to newly created files.
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    writeln!(file, "{pid}")?;
    file.sync_all()?;
    Ok(())
}

/// Remove leftovers of a crashed daemon. Returns whether anything was removed.
///
/// A running daemon is left alone. A stale PID file goes together with the
/// socket; a socket without any PID file goes on its own.
pub fn cleanup_stale(paths: &Paths) -> Result<bool> {
    let status = get_status(Some(paths));
    if status.running {
        return Ok(false);
    }

    let mut cleaned = false;
    if status.stale {
        info!(pid = status.pid, "removing stale PID file");
        cleaned |= remove_if_exists(&paths.pid)?;
    }
    if paths.socket.exists() && (status.stale || !paths.pid.exists()) {
        info!(socket = %paths.socket.display(), "removing orphaned socket");
        cleaned |= remove_if_exists(&paths.socket)?;
    }
    Ok(cleaned)
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(BazelleError::Cleanup {
            path: path.to_path_buf(),
            message: e.to_string(),
        }),
    }
}

/// SIGTERM.
pub fn stop_process(pid: i32) -> Result<()> {
    send_signal(pid, libc::SIGTERM)
}

/// SIGKILL.
pub fn kill_process(pid: i32) -> Result<()> {
    send_signal(pid, libc::SIGKILL)
}

fn send_signal(pid: i32, signal: libc::c_int) -> Result<()> {
    if pid <= 0 || !is_process_running(pid) {
        return Err(BazelleError::NoSuchProcess(pid));
    }
    // SAFETY: pid is positive, so this targets exactly one process.
    if unsafe { libc::kill(pid, signal) } != 0 {
        let source = io::Error::last_os_error();
        if source.raw_os_error() == Some(libc::ESRCH) {
            return Err(BazelleError::NoSuchProcess(pid));
        }
        return Err(BazelleError::Signal { pid, source });
    }
    debug!(pid, signal, "signal sent");
    Ok(())
}

/// Poll until `pid` is gone. Returns false on timeout.
pub fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        reap(pid);
        if !is_process_running(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            warn!(pid, timeout_ms = timeout.as_millis() as u64, "process still running");
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Collect `pid` if it is our exited child, so it does not linger as a zombie.
fn reap(pid: i32) {
    let mut status = 0;
    // SAFETY: WNOHANG never blocks; a pid that is not our child yields ECHILD.
    unsafe {
        libc::waitpid(pid, &mut status, libc::WNOHANG);
    }
}
