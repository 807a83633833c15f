//! Error types for bazelle.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the daemon, its client, and the incremental engine.
#[derive(Debug, Error)]
pub enum BazelleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// The daemon socket is absent or refused the connection.
    #[error("daemon not running (no listener at {})", .0.display())]
    NotRunning(PathBuf),

    /// The connection to the daemon was closed.
    #[error("not connected to daemon")]
    NotConnected,

    #[error("request {id} timed out after {timeout_ms}ms")]
    Timeout { id: i64, timeout_ms: u64 },

    #[error("connecting to {} timed out after {timeout_ms}ms", path.display())]
    ConnectTimeout { path: PathBuf, timeout_ms: u64 },

    /// The daemon answered with an error Response.
    #[error("daemon error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("invalid response from daemon: {0}")]
    InvalidResponse(String),

    #[error("process {0} does not exist")]
    NoSuchProcess(i32),

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon already running (pid {0})")]
    AlreadyRunning(i32),

    #[error("daemon failed to start: {0}")]
    StartFailed(String),

    #[error("daemon (pid {0}) did not exit after SIGKILL")]
    StopFailed(i32),

    #[error("scan failed at {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("walk error: {0}")]
    Walk(#[from] ignore::Error),

    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    #[error("path not found in workspace: {0}")]
    PathNotFound(String),

    #[error("failed to clean up {}: {message}", path.display())]
    Cleanup { path: PathBuf, message: String },

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectFailed { attempts: u32 },

    #[error("update command failed: {0}")]
    UpdateFailed(String),
}

pub type Result<T> = std::result::Result<T, BazelleError>;

impl BazelleError {
    /// True for transport conditions a caller may treat as "daemon is gone".
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            BazelleError::NotRunning(_) | BazelleError::NotConnected
        )
    }
}
