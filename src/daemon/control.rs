//! Daemon control — starting a background daemon and stopping a running one.
//!
//! Stopping escalates: `shutdown` RPC (or SIGTERM when the socket does not
//! answer), then SIGKILL if the process is still alive after the grace period.

use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::client::Client;
use super::lifecycle::{self, cleanup_stale, get_status, kill_process, stop_process, wait_for_exit};
use super::paths::Paths;
use crate::app::App;
use crate::error::{BazelleError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopTimeouts {
    pub connect: Duration,
    /// Wait after the RPC or SIGTERM.
    pub graceful: Duration,
    /// Wait after SIGKILL.
    pub kill: Duration,
}

impl Default for StopTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            graceful: Duration::from_secs(5),
            kill: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// Exited after the `shutdown` RPC.
    Graceful,
    /// Exited after SIGTERM.
    Terminated,
    /// Exited after SIGKILL.
    Killed,
}

/// Stop the daemon recorded in `paths`. `progress` receives one line per step.
pub fn stop_daemon(
    paths: &Paths,
    timeouts: &StopTimeouts,
    progress: &mut dyn FnMut(&str),
) -> Result<StopOutcome> {
    let status = get_status(Some(paths));
    if !status.running {
        if status.stale {
            cleanup_stale(paths)?;
        }
        return Ok(StopOutcome::NotRunning);
    }
    let pid = status.pid;

    progress(&format!("Stopping daemon (pid {pid})..."));
    let graceful = match Client::connect(&paths.socket, timeouts.connect)
        .map(|c| c.with_request_timeout(Some(timeouts.connect)))
        .and_then(|c| c.shutdown())
    {
        Ok(result) => {
            debug!(message = %result.message, "shutdown acknowledged");
            true
        }
        Err(e) => {
            progress(&format!("Graceful shutdown failed ({e}), sending SIGTERM"));
            match stop_process(pid) {
                Ok(()) => {}
                Err(BazelleError::NoSuchProcess(_)) => {}
                Err(e) => warn!(pid, error = %e, "SIGTERM failed"),
            }
            false
        }
    };

    if wait_for_exit(pid, timeouts.graceful) {
        finish_cleanup(paths);
        return Ok(if graceful {
            StopOutcome::Graceful
        } else {
            StopOutcome::Terminated
        });
    }

    progress(&format!(
        "Daemon still running after {}s, sending SIGKILL",
        timeouts.graceful.as_secs()
    ));
    match kill_process(pid) {
        Ok(()) | Err(BazelleError::NoSuchProcess(_)) => {}
        Err(e) => warn!(pid, error = %e, "SIGKILL failed"),
    }
    if wait_for_exit(pid, timeouts.kill) {
        finish_cleanup(paths);
        return Ok(StopOutcome::Killed);
    }
    Err(BazelleError::StopFailed(pid))
}

/// A killed daemon leaves its files behind.
fn finish_cleanup(paths: &Paths) {
    if let Err(e) = cleanup_stale(paths) {
        warn!(error = %e, "cleanup after stop failed");
    }
}

/// Re-run this executable as `daemon run --log-file` in its own process
/// group and wait until it answers on the socket. Returns the child's pid.
pub fn spawn_background(app: &App) -> Result<i32> {
    let status = get_status(Some(&app.paths));
    if status.running {
        return Err(BazelleError::AlreadyRunning(status.pid));
    }

    app.paths.ensure_dir()?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&app.paths.log)?;
    let exe = std::env::current_exe()?;

    let mut child = Command::new(exe)
        .arg("--workspace")
        .arg(&app.workspace)
        .arg("--daemon-dir")
        .arg(&app.paths.dir)
        .args(["daemon", "run", "--log-file"])
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .process_group(0)
        .spawn()?;
    let pid = child.id() as i32;
    info!(pid, log = %app.paths.log.display(), "daemon spawned");

    let timeout = app.config.daemon.connect_timeout();
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(exit) = child.try_wait()? {
            return Err(BazelleError::StartFailed(format!(
                "daemon exited with {exit}; see {}",
                app.paths.log.display()
            )));
        }
        if lifecycle::read_pid(&app.paths.pid) == Some(pid)
            && Client::connect(&app.paths.socket, Duration::from_millis(500)).is_ok()
        {
            return Ok(pid);
        }
        if Instant::now() >= deadline {
            return Err(BazelleError::StartFailed(format!(
                "no socket at {} after {}ms",
                app.paths.socket.display(),
                timeout.as_millis()
            )));
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_stop_when_not_running() {
        let tmp = tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        let mut lines = Vec::new();
        let outcome = stop_daemon(&paths, &StopTimeouts::default(), &mut |l: &str| lines.push(l.to_string())).unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
        assert!(lines.is_empty());
    }

    #[test]
    fn test_stop_cleans_stale_files() {
        let tmp = tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        fs::write(&paths.pid, "999999999").unwrap();
        fs::write(&paths.socket, "").unwrap();

        let outcome = stop_daemon(&paths, &StopTimeouts::default(), &mut |_: &str| {}).unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
        assert!(!paths.pid.exists());
        assert!(!paths.socket.exists());
    }

    #[test]
    fn test_stop_falls_back_to_sigterm() {
        let tmp = tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        lifecycle::write_pid(&paths.pid, child.id()).unwrap();

        let timeouts = StopTimeouts {
            connect: Duration::from_millis(200),
            ..StopTimeouts::default()
        };
        let mut lines = Vec::new();
        let outcome = stop_daemon(&paths, &timeouts, &mut |l: &str| lines.push(l.to_string())).unwrap();
        assert_eq!(outcome, StopOutcome::Terminated);
        assert!(lines.iter().any(|l| l.contains("SIGTERM")));
        assert!(!paths.pid.exists());
    }

    #[test]
    fn test_stop_escalates_to_sigkill() {
        let tmp = tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        let child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        lifecycle::write_pid(&paths.pid, child.id()).unwrap();
        // Let the shell install its trap.
        std::thread::sleep(Duration::from_millis(200));

        let timeouts = StopTimeouts {
            connect: Duration::from_millis(200),
            graceful: Duration::from_millis(300),
            ..StopTimeouts::default()
        };
        let mut lines = Vec::new();
        let outcome = stop_daemon(&paths, &timeouts, &mut |l: &str| lines.push(l.to_string())).unwrap();
        assert_eq!(outcome, StopOutcome::Killed);
        assert!(lines.iter().any(|l| l.contains("SIGKILL")));
        assert!(!paths.pid.exists());
    }
}
