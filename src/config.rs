//! Configuration loaded from `<workspace>/bazelle.toml`.
//!
//! Every field has a default, so an absent file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::Result;

/// Name of the per-workspace config file.
pub const CONFIG_FILE: &str = "bazelle.toml";

/// Default daemon directory name (relative to the workspace or the home dir).
pub const DEFAULT_DIR_NAME: &str = ".bazelle";

/// Default debounce window for watch sessions.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Directory-name prefixes skipped by scans and watchers.
pub const DEFAULT_IGNORE: &[&str] = &[
    ".git",
    "bazel-",
    ".bazelle",
    "node_modules",
    "__pycache__",
    ".venv",
    ".idea",
    ".vscode",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub watch: WatchConfig,
    pub languages: BTreeMap<String, Vec<String>>,
    pub update: UpdateConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Daemon directory; relative paths are resolved against the workspace.
    pub dir: Option<PathBuf>,
    pub debounce_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Client per-request timeout; 0 disables it.
    pub request_timeout_ms: u64,
    pub handle_signals: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            dir: None,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            shutdown_timeout_ms: 5000,
            connect_timeout_ms: 5000,
            request_timeout_ms: 30_000,
            handle_signals: true,
        }
    }
}

impl DaemonConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    pub languages: Vec<String>,
    pub ignore: Vec<String>,
    pub max_pending_dirs: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            languages: Vec::new(),
            ignore: DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect(),
            max_pending_dirs: crate::watcher::debounce::DEFAULT_MAX_PENDING_DIRS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpdateConfig {
    /// Program and leading arguments; targets are appended.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load `<workspace>/bazelle.toml`, falling back to defaults if it is absent.
    pub fn load(workspace: &Path) -> Result<Self> {
        let path = workspace.join(CONFIG_FILE);
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
